//! Atomic CBOR snapshots of the holder directory.
//!
//! ## Design
//!
//! - **Atomic**: written to a sibling temp file, synced, then renamed over
//!   the previous snapshot, so a crash never leaves a half-written file
//! - **Versioned**: a format number guards against reading foreign data
//! - **Strict**: a snapshot that exists but cannot be decoded is an error,
//!   never silently replaced by an empty directory

use crate::directory::HolderDirectory;
use crate::serialization::{read_cbor, write_cbor};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current snapshot format.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to write snapshot '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read snapshot '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed snapshot: {0}")]
    Malformed(String),
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    directory: HolderDirectory,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: u32,
    directory: &'a HolderDirectory,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `directory` to `path` atomically.
pub fn save_snapshot(path: &Path, directory: &HolderDirectory) -> Result<(), SnapshotError> {
    let write_err = |source| SnapshotError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp = temp_path(path);
    let file = File::create(&tmp).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    write_cbor(
        &SnapshotRef {
            format: SNAPSHOT_FORMAT,
            directory,
        },
        &mut writer,
    )
    .map_err(|e| SnapshotError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::Other, e.to_string()),
    })?;
    writer.flush().map_err(write_err)?;
    writer
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?
        .sync_all()
        .map_err(write_err)?;

    fs::rename(&tmp, path).map_err(write_err)
}

/// Read the snapshot at `path`; `Ok(None)` if there is none yet.
pub fn load_snapshot(path: &Path) -> Result<Option<HolderDirectory>, SnapshotError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let snapshot: Snapshot =
        read_cbor(BufReader::new(file)).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(SnapshotError::Malformed(format!(
            "unsupported format {} (expected {SNAPSHOT_FORMAT})",
            snapshot.format
        )));
    }
    Ok(Some(snapshot.directory))
}
