//! Glyph pool for Huddle.
//!
//! Glyphs are the identity tokens handed out to clients. The set of glyphs
//! is fixed at startup; a glyph is either queued as available or held by
//! exactly one live session, and released glyphs go back to the tail of the
//! queue.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Glyph pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every glyph is held.
    #[error("Glyph pool exhausted")]
    Exhausted,

    /// Glyph is held by another session.
    #[error("Glyph {0} is held by another session")]
    NotAvailable(String),

    /// Glyph is not part of the pool.
    #[error("Unknown glyph: {0}")]
    UnknownToken(String),

    /// Glyph is not currently held.
    #[error("Glyph {0} is not held")]
    NotHeld(String),

    /// Malformed glyph definition.
    #[error("Invalid glyph definition on line {line}: {reason}")]
    Definition {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the line.
        reason: String,
    },

    /// Definition file could not be read.
    #[error("Failed to read glyph definitions: {0}")]
    Io(#[from] std::io::Error),
}

/// A glyph handed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphGrant {
    /// Glyph id (identity token).
    pub id: String,
    /// Glyph payload sent to the client.
    pub data: String,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of glyphs defined.
    pub capacity: usize,
    /// Glyphs waiting in the queue.
    pub available: usize,
    /// Glyphs held by sessions.
    pub held: usize,
}

#[derive(Debug)]
struct PoolState {
    available: VecDeque<String>,
    held: HashSet<String>,
}

/// The glyph pool.
///
/// One lock covers both the queue and the held set, so every operation
/// moves a glyph between them atomically.
#[derive(Debug)]
pub struct GlyphPool {
    /// Glyph id -> payload. Never changes after construction.
    glyphs: HashMap<String, String>,
    state: Mutex<PoolState>,
}

impl GlyphPool {
    /// Create a pool from `(id, payload)` pairs. Queue order follows input order.
    ///
    /// # Errors
    ///
    /// Returns an error if an id appears twice.
    pub fn new<I, K, V>(definitions: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut glyphs = HashMap::new();
        let mut available = VecDeque::new();

        for (index, (id, data)) in definitions.into_iter().enumerate() {
            let id = id.into();
            if glyphs.contains_key(&id) {
                return Err(PoolError::Definition {
                    line: index + 1,
                    reason: format!("duplicate glyph id {id}"),
                });
            }
            glyphs.insert(id.clone(), data.into());
            available.push_back(id);
        }

        if glyphs.is_empty() {
            warn!("Glyph pool is empty, no client will be identified");
        }

        Ok(Self {
            glyphs,
            state: Mutex::new(PoolState {
                available,
                held: HashSet::new(),
            }),
        })
    }

    /// Parse glyph definitions, one `<id> <payload>` pair per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error for a line without payload or a duplicate id.
    pub fn parse(text: &str) -> Result<Self, PoolError> {
        let mut definitions = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (id, data) = line
                .split_once(char::is_whitespace)
                .map(|(id, data)| (id, data.trim()))
                .filter(|(_, data)| !data.is_empty())
                .ok_or_else(|| PoolError::Definition {
                    line: index + 1,
                    reason: "expected `<id> <payload>`".to_string(),
                })?;

            if !seen.insert(id) {
                return Err(PoolError::Definition {
                    line: index + 1,
                    reason: format!("duplicate glyph id {id}"),
                });
            }
            definitions.push((id, data));
        }

        Self::new(definitions)
    }

    /// Load glyph definitions from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let pool = Self::parse(&text)?;
        info!(path = %path.display(), glyphs = pool.capacity(), "Loaded glyph definitions");
        Ok(pool)
    }

    /// Take the glyph at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when no glyph is available; the pool
    /// is left untouched.
    pub fn allocate(&self) -> Result<GlyphGrant, PoolError> {
        let mut state = self.state.lock();
        let id = state.available.pop_front().ok_or(PoolError::Exhausted)?;
        state.held.insert(id.clone());
        drop(state);

        debug!(glyph = %id, "Glyph allocated");
        Ok(self.grant(id))
    }

    /// Grant a specific glyph if it is not held by anyone.
    ///
    /// Used when a client presents the glyph it had on an earlier connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownToken`] for ids outside the pool and
    /// [`PoolError::NotAvailable`] when another session holds the glyph.
    pub fn reuse_if_free(&self, id: &str) -> Result<GlyphGrant, PoolError> {
        if !self.glyphs.contains_key(id) {
            return Err(PoolError::UnknownToken(id.to_string()));
        }

        let mut state = self.state.lock();
        if state.held.contains(id) {
            return Err(PoolError::NotAvailable(id.to_string()));
        }
        state.available.retain(|queued| queued != id);
        state.held.insert(id.to_string());
        drop(state);

        debug!(glyph = %id, "Glyph reused");
        Ok(self.grant(id.to_string()))
    }

    /// Return a held glyph to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotHeld`] if the glyph is not held; nothing is
    /// queued in that case.
    pub fn release(&self, id: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if !state.held.remove(id) {
            return Err(PoolError::NotHeld(id.to_string()));
        }
        state.available.push_back(id.to_string());
        drop(state);

        debug!(glyph = %id, "Glyph released");
        Ok(())
    }

    /// Check whether a glyph is held by a session.
    #[must_use]
    pub fn is_held(&self, id: &str) -> bool {
        self.state.lock().held.contains(id)
    }

    /// Check whether a glyph belongs to the pool.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.glyphs.contains_key(id)
    }

    /// Get the payload of a glyph.
    #[must_use]
    pub fn payload(&self, id: &str) -> Option<&str> {
        self.glyphs.get(id).map(String::as_str)
    }

    /// Number of glyphs defined.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.glyphs.len()
    }

    /// Number of glyphs waiting in the queue.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Number of glyphs held by sessions.
    #[must_use]
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Observe all counters under one lock.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.glyphs.len(),
            available: state.available.len(),
            held: state.held.len(),
        }
    }

    fn grant(&self, id: String) -> GlyphGrant {
        let data = self.glyphs.get(&id).cloned().unwrap_or_default();
        GlyphGrant { id, data }
    }
}
