//! Glacier - Erasure-Coded Storage Overlay
//!
//! Keeps objects stored in a DHT recoverable under churn by scattering
//! erasure-coded fragments across the ring, gossiping who holds what, and
//! regenerating whatever gets lost.
//!
//! Key principles:
//! - Any `num_survivors` of `num_fragments` fragments rebuild an object
//! - One actor owns all directory state (no locks, no interleaving)
//! - Lossy, unordered messaging is assumed; every exchange is retried or
//!   abandoned, never blocked on
//! - A corrupt directory is worse than a crash: capacity violations and
//!   unreadable snapshots stop the node
//!
//! Entry point: [`engine::Glacier`].

pub mod config;
pub mod directory;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod id;
pub mod logging;
pub mod manifest;
pub mod persistence;
pub mod placement;
pub mod protocol;
pub mod serialization;
pub mod substrate;

pub use config::GlacierConfig;
pub use engine::{Collaborators, Event, Glacier, GlacierHandle, InsertOutcome};
pub use error::{GlacierError, Result};
pub use id::{FragmentKey, Id, NodeId, ObjectKey, VersionKey};
pub use manifest::{Manifest, StoredObject};
