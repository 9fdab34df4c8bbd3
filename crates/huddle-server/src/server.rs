//! Listener lifecycle for the Huddle server.

use crate::config::Config;
use crate::handlers::{self, AppState};
use crate::metrics;
use huddle_core::{DisconnectedEvent, GlyphPool, Hub, HubConfig, PoolError, Tick};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Glyph definitions could not be loaded.
    #[error(transparent)]
    Glyphs(#[from] PoolError),

    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] anyhow::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    serve: JoinHandle<io::Result<()>>,
}

/// The relay server: one hub, at most one listener at a time.
pub struct HuddleServer {
    config: Config,
    hub: Arc<Hub>,
    running: Option<Running>,
}

impl HuddleServer {
    /// Create a server, loading glyph definitions from the configured file.
    ///
    /// The receiver yields a [`DisconnectedEvent`] whenever an identified
    /// client goes away.
    ///
    /// # Errors
    ///
    /// Returns an error if the definitions cannot be read or parsed.
    pub fn new(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<DisconnectedEvent>), ServerError> {
        let pool = GlyphPool::load(&config.glyphs.path)?;
        info!(
            path = %config.glyphs.path.display(),
            glyphs = pool.capacity(),
            "Loaded glyph definitions"
        );
        Ok(Self::with_pool(config, Arc::new(pool)))
    }

    /// Create a server around an existing pool.
    #[must_use]
    pub fn with_pool(config: Config, pool: Arc<GlyphPool>) -> (Self, mpsc::UnboundedReceiver<DisconnectedEvent>) {
        let hub_config = HubConfig {
            outgoing_fps: config.outgoing_fps,
            outbound_queue: config.limits.outbound_queue,
        };
        let (hub, events) = Hub::new(pool, hub_config);
        metrics::record_pool(hub.pool().stats());

        let server = Self {
            config,
            hub: Arc::new(hub),
            running: None,
        };
        (server, events)
    }

    /// Bind the listener and start serving. Does nothing if already running.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the port cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }

        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        self.hub.set_accepting(true);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState {
            hub: Arc::clone(&self.hub),
            config: self.config.clone(),
            tracker: tracker.clone(),
        });
        let app = handlers::router(state);

        let token = shutdown.clone();
        let serve = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        info!("Huddle server listening on {}", local);
        info!("WebSocket endpoint: ws://{}{}", local, self.config.websocket_path);

        self.running = Some(Running {
            addr: local,
            shutdown,
            tracker,
            serve,
        });
        Ok(local)
    }

    /// Stop the server.
    ///
    /// Every live client gets a goodbye and a close frame, connection tasks
    /// are given `shutdown.drain_timeout_ms` to finish, and only then is the
    /// listener released. Does nothing if not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.hub.set_accepting(false);
        let closed = self.hub.close_all();

        let drain = self.config.drain_timeout();
        if drain_connections(&running.tracker, drain).await {
            metrics::reset_sessions();
        } else {
            // Stragglers decrement the gauge themselves when they finish
            warn!(
                remaining = running.tracker.len(),
                "Connections did not close within {:?}",
                drain
            );
        }
        metrics::record_pool(self.hub.pool().stats());

        running.shutdown.cancel();
        let abort = running.serve.abort_handle();
        match tokio::time::timeout(drain, running.serve).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Listener exited with error"),
            Ok(Err(e)) => warn!(error = %e, "Listener task failed"),
            Err(_) => {
                warn!("Listener did not shut down in time, aborting");
                abort.abort();
            }
        }

        info!(addr = %running.addr, sessions = closed, "Huddle server stopped");
    }

    /// Stop, then start again with the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound again.
    pub async fn restart(&mut self) -> Result<SocketAddr, ServerError> {
        self.stop().await;
        self.start().await
    }

    /// Change the listening port. A running server is fully stopped before
    /// the new listener is bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the new port cannot be bound.
    pub async fn set_port(&mut self, port: u16) -> Result<(), ServerError> {
        if port == self.config.port {
            return Ok(());
        }

        debug!(from = self.config.port, to = port, "Changing port");
        self.config.port = port;
        if self.running.is_some() {
            self.restart().await?;
        }
        Ok(())
    }

    /// Change the outbound proximity rate. Applies immediately.
    pub fn set_outgoing_fps(&mut self, fps: u32) {
        self.config.outgoing_fps = fps.max(1);
        self.hub.set_outgoing_fps(fps);
    }

    /// Feed one upstream batch to the clients. The batch is handed back.
    pub fn process(&self, tick: Tick) -> Tick {
        let stats = self.hub.process_tick(&tick);
        metrics::record_dispatch(&stats, !tick.proximities.is_empty(), self.hub.inbound_fps());
        tick
    }

    /// Address of the running listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    /// Check whether a listener is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.hub.session_count()
    }

    /// Get the hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Close the tracker and wait for its tasks. Returns `false` if some were
/// still running after `timeout`.
async fn drain_connections(tracker: &TaskTracker, timeout: Duration) -> bool {
    tracker.close();
    tokio::time::timeout(timeout, tracker.wait()).await.is_ok()
}

impl Drop for HuddleServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.hub.set_accepting(false);
            self.hub.close_all();
            running.shutdown.cancel();
        }
    }
}
