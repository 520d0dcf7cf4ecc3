//! Human-readable directory dump for operators. Not authoritative.

use crate::directory::HolderDirectory;
use crate::substrate::Timestamp;
use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

fn rfc3339(at: Timestamp) -> String {
    humantime::format_rfc3339_millis(UNIX_EPOCH + Duration::from_millis(at)).to_string()
}

pub fn render_dump(directory: &HolderDirectory) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Directory of {} (seq {}, {} objects, {} holders)",
        directory.local_id(),
        directory.current_seq(),
        directory.len(),
        directory.registry().len()
    );
    for file in directory.files() {
        let _ = writeln!(out, " - File {}", file.key);
        for (fragment, slot) in file.known_slots() {
            let at = match slot.holder {
                Some(node) => node.to_string(),
                None => "(this node)".to_string(),
            };
            let _ = writeln!(
                out,
                "    * Fragment {fragment} at {at} {} {} ({})",
                if slot.certain { "certainly" } else { "probably" },
                if slot.dead { "dead" } else { "alive" },
                rfc3339(slot.last_heard)
            );
        }
    }
    for info in directory.registry().iter() {
        let _ = writeln!(
            out,
            " - Holder {}: {} refs ({} live), last heard {}, acked #{}, received #{}",
            info.node_id,
            info.num_references,
            info.num_live_references,
            rfc3339(info.last_heard_of),
            info.last_acked_seq,
            info.last_received_seq
        );
    }
    out
}

pub fn write_dump(path: &Path, directory: &HolderDirectory) -> std::io::Result<()> {
    std::fs::write(path, render_dump(directory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Id, VersionKey};
    use crate::manifest::Manifest;

    #[test]
    fn test_dump_lists_slots() {
        let mut dir = HolderDirectory::new(Id::from_prefix(1), 3);
        let vk = VersionKey::new(Id::from_prefix(2), 0);
        let manifest = Manifest {
            object_hash: Id::default(),
            fragment_hashes: Vec::new(),
            version: 0,
        };
        dir.mark_new_fragment_stored(&vk.fragment(0), &manifest, 0).unwrap();
        dir.add_or_update_holder(&vk.fragment(1), Id::from_prefix(3), false, false, true, 0)
            .unwrap();

        let dump = render_dump(&dir);
        assert!(dump.contains("Fragment 0 at (this node) certainly alive (1970-01-01T00:00:00.000Z)"));
        assert!(dump.contains("Fragment 1 at <00000000> certainly dead"));
        assert!(dump.contains("0 live"));
    }
}
