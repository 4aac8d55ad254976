//! Property-based testing for Strata
//!
//! Uses proptest to check the content store offset law and that replaying
//! recorded patches onto an empty directory reproduces the scanned tree.

use super::integration::{snapshot, StrataTestHarness};
use ::strata::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// One step applied to the tracked tree between scans
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: PathBuf, content: Vec<u8> },
    Delete { index: usize },
}

/// Generate random relative file paths under a shallow directory structure
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dirs = prop::collection::vec(prop_oneof!["[a-c]", "dir[0-2]"], 0..=2);
    let filename = prop_oneof!["file[0-9]\\.txt", "[a-z]{3,6}\\.(rs|md)"];
    (dirs, filename).prop_map(|(dirs, filename)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            // Keep directory names apart from file names
            path.push(format!("d_{}", dir));
        }
        path.join(filename)
    })
}

/// Generate random file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,300}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 1..2_000),
        (any::<u8>(), 1..500usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOperation::Write { path, content }),
        1 => any::<usize>().prop_map(|index| FileOperation::Delete { index }),
    ]
}

/// Apply `ops` to the harness tree, tracking which files exist
fn run_operations(h: &mut StrataTestHarness, live: &mut Vec<String>, ops: &[FileOperation]) {
    for op in ops {
        match op {
            FileOperation::Write { path, content } => {
                let rel = path.to_string_lossy().to_string();
                h.write(&rel, content);
                if !live.contains(&rel) {
                    live.push(rel);
                }
            }
            FileOperation::Delete { index } => {
                if live.is_empty() {
                    continue;
                }
                let rel = live.remove(index % live.len());
                fs::remove_file(h.root().join(rel)).unwrap();
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_content_offsets_are_contiguous(
        rounds in prop::collection::vec(prop::collection::vec(operation_strategy(), 1..8), 1..4)
    ) {
        let mut h = StrataTestHarness::new();
        let mut live = Vec::new();
        for ops in &rounds {
            run_operations(&mut h, &mut live, ops);
            h.strata.scan().unwrap();
        }

        let index = h.strata.database().index();
        let mut expected_offset = 0;
        for id in 1..index.next_content_id() {
            let record = index.get(id).unwrap();
            prop_assert_eq!(record.store_offset, expected_offset);
            expected_offset = record.end_offset();
        }
        prop_assert_eq!(index.end_offset(), expected_offset);
        let on_disk = fs::metadata(h.storage_dir.path().join("content.store")).unwrap().len();
        prop_assert_eq!(on_disk, expected_offset);
        h.strata.verify(false).unwrap();
    }

    #[test]
    fn prop_patch_replay_reproduces_tree(
        rounds in prop::collection::vec(prop::collection::vec(operation_strategy(), 1..8), 1..4)
    ) {
        let mut h = StrataTestHarness::new();
        let mut live = Vec::new();
        let mut states = BTreeMap::new();
        for ops in &rounds {
            run_operations(&mut h, &mut live, ops);
            if let Some(seq) = h.strata.scan().unwrap().completed_patch {
                states.insert(seq, snapshot(h.root()));
            }
        }

        let target = TempDir::new().unwrap();
        for (seq, state) in &states {
            h.strata.apply_patch(*seq, target.path()).unwrap();
            prop_assert_eq!(&snapshot(target.path()), state);
        }
        for (seq, _) in states.iter().rev() {
            h.strata.revert_patch(*seq, target.path()).unwrap();
            let previous = states.range(..*seq).next_back().map(|(_, s)| s.clone()).unwrap_or_default();
            prop_assert_eq!(snapshot(target.path()), previous);
        }
    }

    #[test]
    fn prop_scan_summary_matches_operations(
        contents in prop::collection::btree_map("[a-z]{1,8}", content_strategy(), 1..12),
        remove_mask in any::<u16>()
    ) {
        let mut h = StrataTestHarness::new();
        for (name, content) in &contents {
            h.write(name, content);
        }
        let summary = h.strata.scan().unwrap();
        prop_assert_eq!(summary.entries_added, contents.len());
        prop_assert_eq!(summary.bytes_stored, contents.values().map(|c| c.len() as u64).sum::<u64>());

        let mut removed = Vec::new();
        for (i, name) in contents.keys().enumerate() {
            if remove_mask & (1 << (i % 16)) != 0 {
                fs::remove_file(h.root().join(name)).unwrap();
                removed.push(name.clone());
            }
        }
        let summary = h.strata.scan().unwrap();
        prop_assert_eq!(summary.entries_removed, removed.len());
        prop_assert_eq!(summary.entries_added, 0);
        if removed.is_empty() {
            prop_assert_eq!(summary.completed_patch, None);
        } else {
            let seq = summary.completed_patch.unwrap();
            let patch = h.strata.get_patch(seq).unwrap();
            let names: Vec<&String> = patch.root.removes.keys().collect();
            prop_assert_eq!(names, removed.iter().collect::<Vec<_>>());
        }
    }
}
