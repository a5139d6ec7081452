//! Engine Configuration
//!
//! The engine is configured per thread. A configuration selects the
//! propagation strategy and the way pending notifications are flushed.
//!
//! Configurations are plain serde types so hosts can load them from JSON:
//!
//! ```rust,ignore
//! let config = EngineConfig::from_json(r#"{ "backend": "flat", "flush": "local_task" }"#)?;
//! vitrio_core::configure(config)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of i32 slots reserved for the backend's update buffer.
pub const DEFAULT_UPDATE_BUFFER_CAPACITY: usize = 4096;

/// Default bound on the number of flush rounds `settle` performs.
pub const DEFAULT_MAX_FLUSH_ROUNDS: usize = 100;

/// Which propagation strategy the runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process worklist traversal over the cell store.
    #[default]
    None,

    /// The bundled integer-indexed [`FlatGraph`](crate::graph::FlatGraph).
    Flat,
}

/// How the pending notification set gets flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// The host calls [`flush`](crate::flush) or [`settle`](crate::settle)
    /// from its own event loop.
    #[default]
    Manual,

    /// A `tokio` local task is spawned on the first enqueue, when writes
    /// happen inside [`run_local`](crate::run_local). Elsewhere the flush
    /// is left to the host, as with `Manual`.
    LocalTask,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Propagation strategy.
    pub backend: BackendKind,

    /// Initial update buffer size (in node ids) for the flat backend.
    pub update_buffer_capacity: usize,

    /// Flush scheduling.
    pub flush: FlushMode,

    /// Upper bound for `settle`.
    pub max_flush_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::None,
            update_buffer_capacity: DEFAULT_UPDATE_BUFFER_CAPACITY,
            flush: FlushMode::Manual,
            max_flush_rounds: DEFAULT_MAX_FLUSH_ROUNDS,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builder-style backend selection.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Builder-style flush mode selection.
    pub fn with_flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }
}
