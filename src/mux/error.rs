use thiserror::Error;

use crate::config::ConfigError;
use crate::mux::types::{Capability, DataKind, ReferenceKey};

/// Raised by an upstream connector that could not open (or close) a feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream connection failed: {message}")]
pub struct ConnectError {
    pub message: String,
}

impl ConnectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to activate {kind} feed for {key}")]
    Activation {
        kind: DataKind,
        key: ReferenceKey,
        #[source]
        source: ConnectError,
    },
}

/// Raised when an aggregator cannot attach to its data sources.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid aggregator settings: {0}")]
    Config(#[from] ConfigError),
    #[error("data source lacks the {0:?} capability")]
    MissingCapability(Capability),
    #[error(transparent)]
    Subscribe(#[from] MuxError),
}

pub type MuxResult<T> = Result<T, MuxError>;
