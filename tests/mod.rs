//! Main test module for Strata
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Property-based tests for invariants
//! - Edge cases around names and special files

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use super::integration::{snapshot, StrataTestHarness};
    use ::strata::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_unicode_filenames() {
        let mut h = StrataTestHarness::new();
        let names = ["файл.txt", "文件.txt", "ファイル.txt", "αρχείο.txt", "🚀🌟💾.txt"];
        for name in &names {
            h.write(name, format!("Unicode content: {}", name).as_bytes());
        }
        let seq = h.strata.scan().unwrap().completed_patch.unwrap();

        let target = TempDir::new().unwrap();
        h.strata.apply_patch(seq, target.path()).unwrap();
        for name in &names {
            let content = fs::read_to_string(target.path().join(name)).unwrap();
            assert_eq!(content, format!("Unicode content: {}", name));
        }
    }

    #[test]
    fn test_special_filenames() {
        let mut h = StrataTestHarness::new();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file[with]brackets.txt",
        ];
        for name in &names {
            h.write(name, name.as_bytes());
        }
        h.strata.scan().unwrap();

        let target = TempDir::new().unwrap();
        h.strata.apply_patch(1, target.path()).unwrap();
        assert_eq!(snapshot(target.path()), snapshot(h.root()));
    }

    #[test]
    fn test_empty_files_get_records() {
        let mut h = StrataTestHarness::new();
        h.write("empty", b"");
        h.write("full", b"data");
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.bytes_stored, 4);
        assert_eq!(h.strata.database().index().len(), 2);

        let empty = h.live("empty").unwrap();
        let record = h
            .strata
            .database()
            .index()
            .get(empty.as_regular_file().unwrap().content_id)
            .copied()
            .unwrap();
        assert_eq!(record.uncompressed_length, 0);
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let mut h = StrataTestHarness::new();
        h.write("node", b"file first");
        h.strata.scan().unwrap();

        fs::remove_file(h.root().join("node")).unwrap();
        h.write("node/inner", b"now a directory");
        h.strata.scan().unwrap();

        let patch = h.strata.get_patch(2).unwrap();
        assert!(patch.root.removes.contains_key("node"));
        assert_eq!(patch.root.subdirs["node"].state, DirState::Added);
        assert!(patch.root.subdirs["node"].adds.contains_key("inner"));

        let target = TempDir::new().unwrap();
        h.strata.apply_patch(1, target.path()).unwrap();
        h.strata.apply_patch(2, target.path()).unwrap();
        assert_eq!(fs::read(target.path().join("node/inner")).unwrap(), b"now a directory");
        h.strata.revert_patch(2, target.path()).unwrap();
        assert_eq!(fs::read(target.path().join("node")).unwrap(), b"file first");
    }

    #[test]
    fn test_removed_directory_tree() {
        let mut h = StrataTestHarness::new();
        h.write("a/b/c/deep.txt", b"deep");
        h.write("a/top.txt", b"top");
        h.strata.scan().unwrap();

        fs::remove_dir_all(h.root().join("a")).unwrap();
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.dirs_removed, 3);
        assert_eq!(summary.entries_removed, 2);
        assert!(h.live("a").is_none());

        let patch = h.strata.get_patch(2).unwrap();
        assert_eq!(patch.root.subdirs["a"].state, DirState::Removed);
        let dump = patch.root.dump();
        assert!(dump.contains("REMOVED"));
        assert!(dump.contains("/a/b/c"));
    }

    #[cfg(unix)]
    #[test]
    fn test_special_file_types() {
        let mut h = StrataTestHarness::new();
        nix::unistd::mkfifo(&h.root().join("pipe"), nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        std::os::unix::fs::symlink("../elsewhere", h.root().join("dangling")).unwrap();
        h.write("plain", b"plain");
        h.strata.scan().unwrap();

        assert_eq!(h.live("pipe").unwrap().node_type(), NodeType::Fifo);
        assert_eq!(h.live("dangling").unwrap().node_type(), NodeType::Symlink);

        let target = TempDir::new().unwrap();
        h.strata.apply_patch(1, target.path()).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(fs::symlink_metadata(target.path().join("pipe")).unwrap().file_type().is_fifo());
        assert_eq!(
            fs::read_link(target.path().join("dangling")).unwrap(),
            std::path::Path::new("../elsewhere")
        );
    }
}
