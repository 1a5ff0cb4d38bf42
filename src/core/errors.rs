//! LRK-prefixed error types with structured error codes.
//!
//! The lurker's steady-state work has no recoverable errors; these cover the
//! edges: configuration, thread spawning, and trace output.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, LurkerError>;

/// Top-level error type for the ban lurker.
#[derive(Debug, Error)]
pub enum LurkerError {
    #[error("[LRK-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[LRK-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[LRK-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[LRK-2001] invalid ban predicate: {details}")]
    InvalidBan { details: String },

    #[error("[LRK-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[LRK-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[LRK-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[LRK-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl LurkerError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "LRK-1001",
            Self::MissingConfig { .. } => "LRK-1002",
            Self::ConfigParse { .. } => "LRK-1003",
            Self::InvalidBan { .. } => "LRK-2001",
            Self::Serialization { .. } => "LRK-2101",
            Self::Io { .. } => "LRK-3002",
            Self::ChannelClosed { .. } => "LRK-3003",
            Self::Runtime { .. } => "LRK-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ChannelClosed { .. } | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for LurkerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for LurkerError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<regex::Error> for LurkerError {
    fn from(value: regex::Error) -> Self {
        Self::InvalidBan {
            details: value.to_string(),
        }
    }
}
