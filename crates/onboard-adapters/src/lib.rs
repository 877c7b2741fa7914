//! Backend adapters for investor onboarding.

#![deny(unsafe_code)]

pub mod blob;
pub mod ip;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use blob::FsBlobStore;
pub use ip::HttpIpLookup;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDocumentStore;

use onboard_core::OnboardError;
use thiserror::Error;

/// Adapter-level failures before they are folded into [`OnboardError`].
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid blob path '{0}'")]
    InvalidPath(String),

    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<AdapterError> for OnboardError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::InvalidPath(_) | AdapterError::Io { .. } => {
                OnboardError::Storage(err.to_string())
            }
            AdapterError::Http(_) | AdapterError::Database(_) => {
                OnboardError::Backend(err.to_string())
            }
        }
    }
}
