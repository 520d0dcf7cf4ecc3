//! Property-based tests for the holder directory
//!
//! Tests for:
//! - Idempotent gossip: applying an event twice equals applying it once
//! - Capacity: at most 8 distinct holders per fragment never overflows
//! - Reference counts: registry counts always match the holder slots

use super::*;
use crate::id::Id;
use proptest::prelude::*;

const NUM_FRAGMENTS: usize = 4;

#[derive(Clone, Debug)]
enum Op {
    Update {
        fragment: usize,
        holder: u64,
        alive: bool,
        override_dead: bool,
        certain: bool,
    },
    News {
        fragment: usize,
        holder: u64,
        kind: EventKind,
        sender: u64,
    },
    Kill {
        fragment: usize,
        holder: u64,
    },
    Expire {
        advance: u64,
    },
}

fn kind_strategy() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        Just(EventKind::Acquired),
        Just(EventKind::HandedOff),
        Just(EventKind::NewHolder),
    ]
}

/// Holder ids 1..=7: together with the local copy never more than
/// `MAX_HOLDERS_PER_FRAGMENT` distinct holders for any fragment.
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..NUM_FRAGMENTS, 1u64..=7, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            |(fragment, holder, alive, override_dead, certain)| Op::Update {
                fragment,
                holder,
                alive,
                override_dead,
                certain,
            }
        ),
        3 => (0..NUM_FRAGMENTS, 1u64..=7, kind_strategy(), 1u64..=7).prop_map(
            |(fragment, holder, kind, sender)| Op::News {
                fragment,
                holder,
                kind,
                sender,
            }
        ),
        1 => (0..NUM_FRAGMENTS, 1u64..=7).prop_map(|(fragment, holder)| Op::Kill { fragment, holder }),
        1 => (0u64..500).prop_map(|advance| Op::Expire { advance }),
    ]
}

fn fresh_directory() -> (HolderDirectory, VersionKey) {
    let mut dir = HolderDirectory::new(Id::from_prefix(0), NUM_FRAGMENTS);
    let vk = VersionKey::new(Id::from_prefix(0x5eed), 0);
    let manifest = Manifest {
        object_hash: Id::default(),
        fragment_hashes: Vec::new(),
        version: 0,
    };
    dir.mark_new_fragment_stored(&vk.fragment(0), &manifest, 0)
        .unwrap();
    (dir, vk)
}

const POLICY: ExpiryPolicy = ExpiryPolicy {
    dead_ms: 100,
    uncertain_ms: 250,
    certain_ms: 400,
};

fn apply(
    dir: &mut HolderDirectory,
    vk: &VersionKey,
    op: &Op,
    now: &mut Timestamp,
) -> Result<(), DirectoryError> {
    match op {
        Op::Update {
            fragment,
            holder,
            alive,
            override_dead,
            certain,
        } => dir.add_or_update_holder(
            &vk.fragment(*fragment),
            Id::from_prefix(*holder),
            *alive,
            *override_dead,
            *certain,
            *now,
        ),
        Op::News {
            fragment,
            holder,
            kind,
            sender,
        } => dir.add_fragment_news(
            &vk.fragment(*fragment),
            Id::from_prefix(*holder),
            *kind,
            Some(Id::from_prefix(*sender)),
            *now,
        ),
        Op::Kill { fragment, holder } => {
            dir.kill_holder(&vk.fragment(*fragment), &Id::from_prefix(*holder));
            Ok(())
        }
        Op::Expire { advance } => {
            *now += advance;
            dir.expire(*now, &POLICY);
            Ok(())
        }
    }
}

fn assert_counts_consistent(dir: &HolderDirectory) -> Result<(), TestCaseError> {
    let counts = dir.count_references();
    for info in dir.registry().iter() {
        let (total, live) = counts.get(&info.node_id).copied().unwrap_or((0, 0));
        prop_assert_eq!(info.num_references, total, "references of {}", info.node_id);
        prop_assert_eq!(info.num_live_references, live, "live references of {}", info.node_id);
    }
    for node in counts.keys() {
        prop_assert!(dir.registry().contains(node), "{} referenced but unregistered", node);
    }
    Ok(())
}

proptest! {
    /// Property: applying the same history event twice yields the same
    /// FileInfo as applying it once
    #[test]
    fn gossip_is_idempotent(
        prefix in prop::collection::vec(op_strategy(), 0..40),
        fragment in 0..NUM_FRAGMENTS,
        holder in 1u64..=7,
        kind in kind_strategy(),
        sender in 1u64..=7,
    ) {
        let (mut dir, vk) = fresh_directory();
        let mut now = 0;
        for op in &prefix {
            apply(&mut dir, &vk, op, &mut now).unwrap();
        }
        let key = vk.fragment(fragment);
        let news = |dir: &mut HolderDirectory| {
            dir.add_fragment_news(&key, Id::from_prefix(holder), kind, Some(Id::from_prefix(sender)), now)
        };

        news(&mut dir).unwrap();
        let once = dir.file(&vk).cloned();
        news(&mut dir).unwrap();
        let twice = dir.file(&vk).cloned();

        prop_assert_eq!(once, twice);
    }

    /// Property: with at most MAX_HOLDERS_PER_FRAGMENT distinct holders per
    /// fragment, no capacity violation ever occurs
    #[test]
    fn capacity_never_exceeded(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let (mut dir, vk) = fresh_directory();
        let mut now = 0;
        for op in &ops {
            let result = apply(&mut dir, &vk, op, &mut now);
            prop_assert!(
                !matches!(result, Err(DirectoryError::CapacityExceeded { .. })),
                "capacity exceeded after {:?}", op
            );
        }
    }

    /// Property: registry reference counts equal the number of slots naming
    /// each holder, after any sequence of operations
    #[test]
    fn reference_counts_match_slots(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let (mut dir, vk) = fresh_directory();
        let mut now = 0;
        for op in &ops {
            let _ = apply(&mut dir, &vk, op, &mut now);
            assert_counts_consistent(&dir)?;
        }
    }
}
