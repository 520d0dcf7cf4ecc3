//! Directory persistence.
//!
//! The CBOR snapshot is the authoritative restart state; the text dump is a
//! best-effort diagnostic written alongside it.

pub mod dump;
pub mod snapshot;

pub use dump::{render_dump, write_dump};
pub use snapshot::{load_snapshot, save_snapshot, SnapshotError, SNAPSHOT_FORMAT};
