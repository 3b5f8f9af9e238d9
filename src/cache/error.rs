//! Errors surfaced by the caching path.
//!
//! Every variant is recoverable from the caller's point of view: the request
//! can always be rendered live. The one non-recoverable misuse (handing
//! `cache_response` a capture that belongs to another request) panics instead.

use std::io;

use thiserror::Error;

use super::content::WriteMode;

#[derive(Debug, Error)]
pub enum CacheError {
    /// More than one registered config accepts the request.
    #[error("request `{path}` matches more than one cache config: {}", configs.join(", "))]
    ConfigConflict { path: String, configs: Vec<String> },

    /// The identity collaborator could not answer a membership question.
    #[error("identity lookup failed: {0}")]
    RepositoryAccess(String),

    /// A cache key could not be derived from a request or classified against a config.
    #[error("failed to create cache key: {0}")]
    KeyCreation(String),

    /// A config points at a store name with no registered implementation.
    #[error("no cache store registered under `{store}`")]
    Persistence { store: String },

    /// Copying bytes between a cached payload and a live response failed.
    #[error("cache data stream failed: {0}")]
    DataStream(#[source] io::Error),

    /// Byte output and text output were both requested on one response.
    #[error("response output already opened as {active}, cannot switch to {requested}")]
    OutputModeConflict {
        active: WriteMode,
        requested: WriteMode,
    },

    /// A config record failed validation and was not registered.
    #[error("invalid cache config `{name}`: {reason}")]
    InvalidConfig { name: String, reason: String },
}

impl CacheError {
    pub fn key_creation(message: impl Into<String>) -> Self {
        Self::KeyCreation(message.into())
    }

    pub fn repository_access(message: impl Into<String>) -> Self {
        Self::RepositoryAccess(message.into())
    }

    pub fn invalid_config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(store: impl Into<String>) -> Self {
        Self::Persistence {
            store: store.into(),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(error: io::Error) -> Self {
        Self::DataStream(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_lists_every_config() {
        let error = CacheError::ConfigConflict {
            path: "/products/1.json".to_string(),
            configs: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "request `/products/1.json` matches more than one cache config: a, b"
        );
    }

    #[test]
    fn mode_conflict_names_both_modes() {
        let error = CacheError::OutputModeConflict {
            active: WriteMode::Bytes,
            requested: WriteMode::Text,
        };
        assert_eq!(
            error.to_string(),
            "response output already opened as bytes, cannot switch to text"
        );
    }
}
