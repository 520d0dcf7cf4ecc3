//! Crate-level error type.
//!
//! Three severities exist. Fatal invariant violations are returned from
//! [`crate::engine::Glacier::handle`] and stop the node (see
//! [`GlacierError::is_fatal`]). Recoverable protocol anomalies are logged
//! and the offending message or job is dropped. Expected transient failures
//! (timeouts, missing answers, dead nodes) only drive retries and are never
//! surfaced as errors.

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::erasure::CodecError;
use crate::id::VersionKey;
use crate::manifest::ManifestError;
use crate::persistence::SnapshotError;
use crate::serialization::SerializationError;
use crate::substrate::SubstrateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlacierError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Manifest does not match object {0}")]
    InvalidManifest(VersionKey),

    #[error("Glacier mailbox is closed")]
    MailboxClosed,
}

impl GlacierError {
    /// True for invariant violations after which the directory can no
    /// longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            GlacierError::Directory(DirectoryError::CapacityExceeded { .. }) => true,
            GlacierError::Snapshot(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GlacierError>;
