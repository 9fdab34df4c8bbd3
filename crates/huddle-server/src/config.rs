//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HUDDLE_*)
//! - TOML configuration file, named by `HUDDLE_CONFIG` or found on the
//!   default search path

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HUDDLE_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Target rate for proximity pushes, in frames per second.
    #[serde(default = "default_outgoing_fps")]
    pub outgoing_fps: u32,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Glyph definitions.
    #[serde(default)]
    pub glyphs: GlyphsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Glyph definition source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlyphsConfig {
    /// File with one `<id> <payload>` pair per line.
    #[serde(default = "default_glyphs_path")]
    pub path: PathBuf,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Time allowed for one socket write, in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time to wait for connections to finish closing, in milliseconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUDDLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1948)
}

fn default_outgoing_fps() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_glyphs_path() -> PathBuf {
    PathBuf::from("resources/glyphs.txt")
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    1_000 // 1 second
}

fn default_drain_timeout() -> u64 {
    2_000 // 2 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outgoing_fps: default_outgoing_fps(),
            websocket_path: default_ws_path(),
            glyphs: GlyphsConfig::default(),
            limits: LimitsConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for GlyphsConfig {
    fn default() -> Self {
        Self {
            path: default_glyphs_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        // Try to load from default paths
        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.outgoing_fps == 0 {
            bail!("outgoing_fps must be at least 1");
        }
        if !self.websocket_path.starts_with('/') {
            bail!("websocket_path must start with '/': {}", self.websocket_path);
        }
        if self.websocket_path == "/health" {
            bail!("websocket_path must not shadow /health");
        }
        if self.limits.outbound_queue == 0 {
            bail!("limits.outbound_queue must be at least 1");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Time allowed for one socket write.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.send_timeout_ms)
    }

    /// Time to wait for connections on shutdown.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.outgoing_fps, 30);
        assert_eq!(config.websocket_path, "/");
        assert_eq!(config.glyphs.path, PathBuf::from("resources/glyphs.txt"));
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.send_timeout(), Duration::from_secs(1));
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 1948,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 1948);

        let config = Config {
            host: "not-an-ip".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000
            outgoing_fps = 15

            [glyphs]
            path = "/opt/huddle/glyphs.txt"

            [limits]
            outbound_queue = 64
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.outgoing_fps, 15);
        assert_eq!(config.glyphs.path, PathBuf::from("/opt/huddle/glyphs.txt"));
        assert_eq!(config.limits.outbound_queue, 64);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host = \"127.0.0.1\"\nport = 2000\nwebsocket_path = \"/huddle\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 2000);
        assert_eq!(config.websocket_path, "/huddle");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host = \"127.0.0.1\"\noutgoing_fps = 0").unwrap();
        assert!(Config::from_file(file.path()).is_err());

        let config = Config {
            host: "127.0.0.1".to_string(),
            websocket_path: "ws".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::from_file("/nonexistent/huddle.toml").is_err());
    }
}
