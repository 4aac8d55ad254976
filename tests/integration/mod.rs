//! Integration tests for Strata
//!
//! End-to-end scenarios over real directories: scanning, patch recording,
//! export/import between databases and applying patches onto fresh trees.

use ::strata::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Tracked directory, its storage and a deterministic mtime clock
pub struct StrataTestHarness {
    pub root_dir: TempDir,
    pub storage_dir: TempDir,
    pub strata: Strata,
    pub files: FileGenerator,
    clock: i64,
}

impl StrataTestHarness {
    pub fn new() -> Self {
        Self::with_builder(StrataBuilder::new())
    }

    pub fn with_builder(builder: StrataBuilder) -> Self {
        let root_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let strata = builder
            .build(root_dir.path().to_path_buf(), storage_dir.path().to_path_buf())
            .unwrap();
        Self {
            root_dir,
            storage_dir,
            strata,
            files: FileGenerator::new(42),
            clock: 1_600_000_000,
        }
    }

    pub fn root(&self) -> &Path {
        self.root_dir.path()
    }

    /// Write `content` at `rel` and pin its mtime to the next clock tick
    pub fn write(&mut self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        set_permissions(&path, 0o644);
        self.clock += 1;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(self.clock, 0)).unwrap();
        path
    }

    /// Populate the tree with nested directories of generated files
    pub fn generate_project(&mut self, config: &ProjectConfig) -> Vec<String> {
        let mut written = Vec::new();
        for depth in 1..=config.max_depth {
            for dir_idx in 0..config.dirs_per_level {
                let dir = (0..depth)
                    .map(|level| format!("dir_{}_{}", level, dir_idx))
                    .collect::<Vec<_>>()
                    .join("/");
                for file_idx in 0..config.files_per_dir {
                    let rel = format!("{}/file_{}.txt", dir, file_idx);
                    let content = self.files.generate_file_content(config.file_size_range.clone());
                    self.write(&rel, &content);
                    written.push(rel);
                }
            }
        }
        written
    }

    /// Modify, delete and add files; returns how many operations ran
    pub fn mutate(&mut self, files: &mut Vec<String>, mutations: usize) -> usize {
        for idx in 0..mutations {
            match self.files.rng.random_range(0..3) {
                0 if !files.is_empty() => {
                    let pick = self.files.rng.random_range(0..files.len());
                    let rel = files[pick].clone();
                    let content = self.files.generate_binary_content(512);
                    self.write(&rel, &content);
                }
                1 if !files.is_empty() => {
                    let pick = self.files.rng.random_range(0..files.len());
                    let rel = files.remove(pick);
                    fs::remove_file(self.root().join(rel)).unwrap();
                }
                _ => {
                    let rel = format!("added_{}/file_{}.bin", idx % 2, idx);
                    let content = self.files.generate_binary_content(256);
                    self.write(&rel, &content);
                    files.push(rel);
                }
            }
        }
        mutations
    }

    /// Close and reopen the storage
    pub fn reopen(self) -> Self {
        let Self {
            root_dir,
            storage_dir,
            strata,
            files,
            clock,
        } = self;
        drop(strata);
        let strata = Strata::open(root_dir.path().to_path_buf(), storage_dir.path().to_path_buf()).unwrap();
        Self {
            root_dir,
            storage_dir,
            strata,
            files,
            clock,
        }
    }

    /// Live-tree node at a relative path
    pub fn live(&self, rel: &str) -> Option<Node> {
        let components: Vec<String> = rel.split('/').map(String::from).collect();
        let (name, parents) = components.split_last()?;
        self.strata
            .database()
            .root()
            .as_directory()?
            .get_dir(parents)?
            .get(name)
            .cloned()
    }
}

impl Default for StrataTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// File generator for test data
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate realistic file content
    pub fn generate_file_content(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        let mut content = Vec::with_capacity(size);
        let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "lorem", "ipsum"];
        while content.len() < size {
            let word = words[self.rng.random_range(0..words.len())];
            content.extend_from_slice(word.as_bytes());
            content.push(b' ');
        }
        content.truncate(size);
        content
    }

    /// Generate binary file content
    pub fn generate_binary_content(&mut self, size: usize) -> Vec<u8> {
        let mut content = vec![0u8; size];
        self.rng.fill(&mut content[..]);
        content
    }
}

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            dirs_per_level: 3,
            files_per_dir: 4,
            file_size_range: 10..4_000,
        }
    }
}

/// Observable state of one tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Dir { mode: u32 },
    File { mode: u32, mtime_nanos: i64, content: Vec<u8> },
    Symlink { target: PathBuf },
}

/// Everything below `root` keyed by relative path
///
/// Directory mtimes are left out; adding an entry always bumps them.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Shape> {
    let mut shapes = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.unwrap();
        let meta = entry.path().symlink_metadata().unwrap();
        let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
        let shape = if meta.file_type().is_symlink() {
            Shape::Symlink {
                target: fs::read_link(entry.path()).unwrap(),
            }
        } else if meta.is_dir() {
            Shape::Dir { mode: mode_of(&meta) }
        } else {
            let mtime = FileTime::from_last_modification_time(&meta);
            Shape::File {
                mode: mode_of(&meta),
                mtime_nanos: mtime.unix_seconds() * 1_000_000_000 + mtime.nanoseconds() as i64,
                content: fs::read(entry.path()).unwrap(),
            }
        };
        shapes.insert(rel, shape);
    }
    shapes
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(not(unix))]
pub fn set_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn zlib_len(data: &[u8], level: u32) -> u64 {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap().len() as u64
    }

    #[test]
    fn test_single_file_first_scan() {
        let mut h = StrataTestHarness::new();
        h.write("a.txt", b"0123456789");

        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.completed_patch, Some(1));
        assert_eq!(summary.entries_added, 1);
        assert_eq!(summary.bytes_stored, 10);

        let patch = h.strata.get_patch(1).unwrap();
        assert!(patch.is_complete);
        assert_eq!(patch.root.adds.len(), 1);
        let file = patch.root.adds["a.txt"].as_regular_file().unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.content_id, 1);
        assert_eq!(patch.root.adds["a.txt"].owner.mode, 0o644);

        let record = h.strata.database().index().get(1).copied().unwrap();
        assert_eq!(record.store_offset, 0);
        assert_eq!(record.uncompressed_length, 10);
        assert_eq!(record.compressed_length, zlib_len(b"0123456789", DEFAULT_COMPRESSION_LEVEL));
        assert_eq!(h.strata.database().index().end_offset(), record.compressed_length);
    }

    #[test]
    fn test_remove_then_rescan() {
        let mut h = StrataTestHarness::new();
        let path = h.write("a.txt", b"0123456789");
        h.strata.scan().unwrap();

        fs::remove_file(path).unwrap();
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.completed_patch, Some(2));
        assert_eq!(summary.entries_removed, 1);

        let patch = h.strata.get_patch(2).unwrap();
        assert!(patch.root.adds.is_empty());
        assert!(patch.root.removes.contains_key("a.txt"));
        assert!(!patch.has_content());
        assert!(h.live("a.txt").is_none());
    }

    #[test]
    fn test_unchanged_tree_creates_no_patch() {
        let mut h = StrataTestHarness::new();
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.completed_patch, None);
        assert!(h.strata.chain_head().is_none());

        h.write("notes/todo.md", b"- ship it\n");
        assert_eq!(h.strata.scan().unwrap().completed_patch, Some(1));

        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.completed_patch, None);
        assert!(!summary.has_changes());
        assert_eq!(h.strata.list_patches().len(), 1);
    }

    #[test]
    fn test_modified_file_is_replaced() {
        let mut h = StrataTestHarness::new();
        h.write("config.toml", b"port = 80\n");
        h.strata.scan().unwrap();

        h.write("config.toml", b"port = 8080\n");
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.entries_removed, 1);
        assert_eq!(summary.entries_added, 1);

        let patch = h.strata.get_patch(2).unwrap();
        let old = patch.root.removes["config.toml"].as_regular_file().unwrap();
        let new = patch.root.adds["config.toml"].as_regular_file().unwrap();
        assert_eq!(old.content_id, 1);
        assert_eq!(new.content_id, 2);
        assert_eq!((patch.starting_content_id, patch.ending_content_id), (2, 2));

        let mut out = Vec::new();
        h.strata.database().retrieve_content(2, &mut out).unwrap();
        assert_eq!(out, b"port = 8080\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_metadata_change_recorded() {
        let mut h = StrataTestHarness::new();
        let path = h.write("run.sh", b"#!/bin/sh\n");
        h.strata.scan().unwrap();

        set_permissions(&path, 0o755);
        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.metadata_changed, 1);
        assert_eq!(summary.entries_added, 0);

        let patch = h.strata.get_patch(2).unwrap();
        let change = patch.root.meta_changes["run.sh"];
        assert_eq!(change.from.mode, 0o644);
        assert_eq!(change.to.mode, 0o755);
        assert_eq!(h.live("run.sh").unwrap().owner.mode, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_hardlinks_stored_once() {
        let mut h = StrataTestHarness::new();
        let b1 = h.write("b1", b"shared bytes");
        fs::hard_link(&b1, h.root().join("b2")).unwrap();

        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.entries_added, 2);
        assert_eq!(summary.hardlinks_resolved, 1);
        assert_eq!(summary.bytes_stored, 12);
        assert_eq!(h.strata.database().index().len(), 1);

        let first = h.live("b1").unwrap();
        let second = h.live("b2").unwrap();
        assert_eq!(
            first.as_regular_file().unwrap().content_id,
            second.as_regular_file().unwrap().content_id
        );
        let file = first.as_regular_file().unwrap();
        let paths = h.strata.database().registry().paths(file.filesystem_id, file.inode);
        assert_eq!(paths, vec!["/b1".to_string(), "/b2".to_string()]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let mut h = StrataTestHarness::new();
        let mut files = h.generate_project(&ProjectConfig::default());
        h.strata.scan().unwrap();
        h.mutate(&mut files, 10);
        h.strata.scan().unwrap();

        let root_before = h.strata.database().root().clone();
        let patches_before = h.strata.list_patches();
        let h = h.reopen();
        assert_eq!(h.strata.database().root(), &root_before);
        assert_eq!(h.strata.list_patches(), patches_before);
        assert!(h.strata.get_patch(2).unwrap().root.dir_count() > 1);

        let mut h = h;
        assert_eq!(h.strata.scan().unwrap().completed_patch, None);
        h.strata.verify(true).unwrap();
    }

    #[test]
    fn test_touch_new_files_stores_placeholders() {
        let mut h = StrataTestHarness::with_builder(StrataBuilder::new().touch_new_paths(vec!["logs".to_string()]));
        h.write("logs/app.log", &[b'x'; 4096]);
        h.write("src/main.rs", b"fn main() {}\n");

        let summary = h.strata.scan().unwrap();
        assert_eq!(summary.bytes_stored, 13);

        let log = h.live("logs/app.log").unwrap();
        let id = log.as_regular_file().unwrap().content_id;
        assert_eq!(h.strata.database().index().get(id).unwrap().uncompressed_length, 0);
        assert_eq!(log.as_regular_file().unwrap().size, 4096);
    }

    #[test]
    fn test_track_dirs_only() {
        let mut h = StrataTestHarness::new();
        h.strata.add_track_dirs_only("cache").unwrap();
        h.write("cache/blob", b"transient");
        h.write("cache/nested/blob", b"transient");

        h.strata.scan().unwrap();
        assert!(h.live("cache/nested").unwrap().is_dir());
        assert!(h.live("cache/blob").is_none());
        assert!(h.live("cache/nested/blob").is_none());
    }

    #[test]
    fn test_ignored_paths_are_skipped() {
        let mut h = StrataTestHarness::new();
        let ignored = h.root().canonicalize().unwrap().join("tmp");
        h.strata.add_ignore(ignored).unwrap();
        h.write("tmp/scratch", b"scratch");
        h.write("keep", b"keep");

        h.strata.scan().unwrap();
        assert!(h.live("tmp").is_none());
        assert!(h.live("keep").is_some());
    }

    #[test]
    fn test_storage_inside_root_is_not_tracked() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("data"), b"payload").unwrap();
        let mut strata = Strata::init(root.path().to_path_buf(), root.path().join(".strata")).unwrap();

        let summary = strata.scan().unwrap();
        assert_eq!(summary.entries_added, 1);
        let live = strata.database().root().as_directory().unwrap();
        assert!(live.get(".strata").is_none());
        assert!(live.get("data").is_some());
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut source = StrataTestHarness::new();
        let mut files = source.generate_project(&ProjectConfig::default());
        source.strata.scan().unwrap();
        source.mutate(&mut files, 12);
        source.strata.scan().unwrap();

        let exports = TempDir::new().unwrap();
        let mirror_root = TempDir::new().unwrap();
        let mirror_storage = TempDir::new().unwrap();
        let mut mirror = Strata::init(
            mirror_root.path().to_path_buf(),
            mirror_storage.path().to_path_buf(),
        )
        .unwrap();

        for seq in 1..=2 {
            let file = exports.path().join(format!("{}.patch", seq));
            let exported = source.strata.export_patch(seq, &file).unwrap();
            let imported = mirror.import_patch(&file).unwrap();
            assert_eq!(imported.sequence_number, seq);
            assert_eq!(imported.header, exported.header);
            assert_eq!(imported.record_count, exported.record_count);

            let original = source.strata.get_patch(seq).unwrap();
            let copy = mirror.get_patch(seq).unwrap();
            assert_eq!(copy.uuid, original.uuid);
            assert_eq!(copy.previous_uuid, original.previous_uuid);
            assert_eq!(copy.root, original.root);
        }

        let report = mirror.verify(true).unwrap();
        assert_eq!(report.patches, 2);
        assert_eq!(report.records, source.strata.database().index().len());
        for id in 1..source.strata.database().index().next_content_id() {
            let mut expected = Vec::new();
            let mut actual = Vec::new();
            source.strata.database().retrieve_content(id, &mut expected).unwrap();
            mirror.database().retrieve_content(id, &mut actual).unwrap();
            assert_eq!(actual, expected, "content {} differs", id);
        }

        let target = TempDir::new().unwrap();
        mirror.apply_patch(1, target.path()).unwrap();
        mirror.apply_patch(2, target.path()).unwrap();
        assert_eq!(snapshot(target.path()), snapshot(source.root()));
    }

    #[test]
    fn test_removal_only_patch_round_trip() -> anyhow::Result<()> {
        let mut source = StrataTestHarness::new();
        let path = source.write("a.txt", b"0123456789");
        source.write("keep.txt", b"kept");
        source.strata.scan()?;
        fs::remove_file(path)?;
        source.strata.scan()?;
        assert!(!source.strata.get_patch(2)?.has_content());

        let exports = TempDir::new()?;
        let mirror_root = TempDir::new()?;
        let mirror_storage = TempDir::new()?;
        let mut mirror = Strata::init(
            mirror_root.path().to_path_buf(),
            mirror_storage.path().to_path_buf(),
        )?;
        for seq in 1..=2 {
            let file = exports.path().join(format!("{}.patch", seq));
            let exported = source.strata.export_patch(seq, &file)?;
            let imported = mirror.import_patch(&file)?;
            assert_eq!(imported.sequence_number, seq);
            assert_eq!(imported.record_count, exported.record_count);
        }
        assert_eq!(mirror.get_patch(2)?.root, source.strata.get_patch(2)?.root);
        mirror.verify(true)?;

        let target = TempDir::new()?;
        mirror.apply_patch(1, target.path())?;
        mirror.apply_patch(2, target.path())?;
        assert!(!target.path().join("a.txt").exists());
        assert_eq!(snapshot(target.path()), snapshot(source.root()));
        Ok(())
    }

    #[test]
    fn test_seeding_is_rejected_once_the_chain_has_patches() -> anyhow::Result<()> {
        let mut h = StrataTestHarness::new();
        h.write("a.txt", b"a");
        h.strata.scan()?;
        h.write("b.txt", b"b");

        let err = h.strata.scan_without_patch().unwrap_err();
        assert!(err.is_chain_error());
        assert!(h.live("b.txt").is_none());

        h.strata.scan()?;
        h.strata.verify(false)?;
        Ok(())
    }

    #[test]
    fn test_seeded_tree_records_only_later_changes() -> anyhow::Result<()> {
        let mut h = StrataTestHarness::new();
        h.write("seed.txt", b"seed");
        let seeded = h.strata.scan_without_patch()?;
        assert_eq!(seeded.entries_added, 1);
        assert!(h.strata.chain_head().is_none());

        h.write("later.txt", b"later");
        let summary = h.strata.scan()?;
        let patch = h.strata.get_patch(summary.completed_patch.unwrap())?;
        assert!(patch.root.adds.contains_key("later.txt"));
        assert!(!patch.root.adds.contains_key("seed.txt"));
        h.strata.verify(false)?;
        Ok(())
    }

    #[test]
    fn test_import_with_mismatched_chain_is_rejected() {
        let mut source = StrataTestHarness::new();
        source.write("a", b"a");
        source.strata.scan().unwrap();
        source.write("b", b"b");
        source.strata.scan().unwrap();

        let mut other = StrataTestHarness::new();
        other.write("c", b"c");
        other.strata.scan().unwrap();
        let head_before = other.strata.chain_head().unwrap().clone();
        let records_before = other.strata.database().index().len();

        let exports = TempDir::new().unwrap();
        for seq in [1, 2] {
            let file = exports.path().join(format!("{}.patch", seq));
            source.strata.export_patch(seq, &file).unwrap();
            let err = other.strata.import_patch(&file).unwrap_err();
            assert!(err.is_chain_error(), "unexpected error: {}", err);
        }

        assert_eq!(other.strata.list_patches().len(), 1);
        assert_eq!(other.strata.chain_head().unwrap(), &head_before);
        assert_eq!(other.strata.database().index().len(), records_before);
        other.strata.verify(true).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_forward_then_reverse() {
        let mut h = StrataTestHarness::new();
        let mut files = h.generate_project(&ProjectConfig {
            max_depth: 2,
            dirs_per_level: 2,
            files_per_dir: 3,
            file_size_range: 1..2_000,
        });
        std::os::unix::fs::symlink("dir_0_0/file_0.txt", h.root().join("latest")).unwrap();
        h.strata.scan().unwrap();
        let before = snapshot(h.root());

        h.mutate(&mut files, 8);
        fs::remove_file(h.root().join("latest")).unwrap();
        std::os::unix::fs::symlink("dir_0_1/file_1.txt", h.root().join("latest")).unwrap();
        set_permissions(&h.root().join("dir_0_1"), 0o750);
        h.strata.scan().unwrap();
        let after = snapshot(h.root());

        let target = TempDir::new().unwrap();
        h.strata.apply_patch(1, target.path()).unwrap();
        assert_eq!(snapshot(target.path()), before);

        let forward = h.strata.apply_patch(2, target.path()).unwrap();
        assert!(forward.forward);
        assert!(forward.warnings.is_empty());
        assert_eq!(snapshot(target.path()), after);

        let reverse = h.strata.revert_patch(2, target.path()).unwrap();
        assert!(!reverse.forward);
        assert_eq!(snapshot(target.path()), before);
    }

    #[test]
    fn test_reverse_on_diverged_target_reports_indeterminate_state() {
        let mut h = StrataTestHarness::new();
        h.write("a.txt", b"a");
        h.strata.scan().unwrap();

        let target = TempDir::new().unwrap();
        let err = h.strata.revert_patch(1, target.path()).unwrap_err();
        assert!(matches!(err, StrataError::Reconstruction { .. }));
        assert!(err.user_message().contains("indeterminate state"));
    }
}
