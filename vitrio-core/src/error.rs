//! Error types for the reactive engine.

use thiserror::Error;

use crate::graph::BackendError;
use crate::reactive::AtomId;

/// Errors raised by reactive operations.
#[derive(Error, Debug)]
pub enum ReactiveError {
    /// A write was attempted on a derived atom.
    #[error("atom {0} is derived and cannot be written")]
    ReadOnlyAtom(AtomId),

    /// A derivation read itself, directly or through other atoms.
    #[error("cyclic dependency detected while evaluating atom {0}")]
    Cycle(AtomId),

    /// An error produced by a read function. The engine does not inspect it.
    #[error("read function failed: {0}")]
    User(Box<dyn std::error::Error + 'static>),

    /// The cell behind a handle holds a value of a different type.
    #[error("atom {0} holds a value of a different type")]
    TypeMismatch(AtomId),

    /// The handle does not belong to the current thread's runtime.
    #[error("atom {0} is unknown to this runtime")]
    UnknownAtom(AtomId),

    /// `settle` kept producing notifications past the configured bound.
    #[error("notifications did not settle after {0} flush rounds")]
    FlushLimit(usize),

    /// The acceleration backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Malformed engine configuration.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ReactiveError {
    /// Wrap an arbitrary error raised inside a read function.
    pub fn user<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + 'static>>,
    {
        Self::User(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ReactiveError>;
