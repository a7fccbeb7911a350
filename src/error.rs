//! Library error type
//!
//! Probe failures are not errors; they are folded into loss accounting.
//! Everything here is fatal to a single operation (one pipeline run or one
//! store's sync), never to the process.

use std::fmt;

/// Errors surfaced by the measurement pipeline and the record stores
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unusable configuration: no candidates, unreadable input, missing credentials
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote record store rejected a request
    #[error("{store} API error: {message}")]
    StoreApi { store: String, message: String },

    /// Transport failure while talking to a remote store
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote response did not have the expected shape
    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Configuration(msg.to_string())
    }

    pub fn store(store: impl Into<String>, msg: impl fmt::Display) -> Self {
        Error::StoreApi {
            store: store.into(),
            message: msg.to_string(),
        }
    }

    /// True for errors that come from a remote store rejecting a request
    pub fn is_store_rejection(&self) -> bool {
        matches!(self, Error::StoreApi { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
