//! Main Strata implementation
//!
//! [`Strata`] ties the engine together for one tracked directory: it owns the
//! storage directory, loads the database on open, discovers mounts, and runs
//! scans, exports, imports and applies.
//!
//! ## Storage layout
//!
//! ```text
//! <storage>/
//! ├── config.json     StrataConfig, pretty JSON
//! ├── content.store   append-only compressed content
//! └── db/             sled database (live tree, registry, chain)
//! ```

use crate::applier::PatchApplier;
use crate::chain::Patch;
use crate::database::Database;
use crate::error::{Result, StrataError};
use crate::filter::Filter;
use crate::fs_source::{FileSystem, LocalFileSystem};
use crate::object_store::SledObjectStore;
use crate::patch_file::{self, PatchFileInfo};
use crate::recorder::PatchRecorder;
use crate::scanner::Scanner;
use crate::types::{ApplySummary, ScanSummary, StrataConfig, DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use crate::updater::LiveUpdater;
use crate::utils;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

const CONFIG_FILE: &str = "config.json";
const CONTENT_FILE: &str = "content.store";
const DB_DIR: &str = "db";

/// Result of an integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Patches in the chain
    pub patches: usize,
    /// Content records in the index
    pub records: usize,
    /// Uncompressed bytes decompressed during a deep check
    pub bytes_checked: u64,
}

/// Versioned snapshots of one directory tree
///
/// # Examples
///
/// ```rust,no_run
/// use strata::Strata;
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut strata = Strata::init(PathBuf::from("/srv/data"), PathBuf::from("/var/lib/strata"))?;
/// let summary = strata.scan()?;
/// if let Some(seq) = summary.completed_patch {
///     strata.export_patch(seq, &PathBuf::from(format!("/tmp/{}.patch", seq)))?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Strata {
    root_path: PathBuf,
    config: StrataConfig,
    db: Database,
    fs: LocalFileSystem,
    filter: Filter,
}

impl std::fmt::Debug for Strata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strata")
            .field("root_path", &self.root_path)
            .field("storage_path", &self.config.storage_path)
            .field("db", &self.db)
            .finish()
    }
}

impl Strata {
    /// Initialize storage for tracking `root_path`
    ///
    /// Fails with [`StrataError::StorageAlreadyExists`] when `storage_path`
    /// already holds a configuration; use [`Strata::open`] for that.
    #[instrument(skip(storage_path))]
    pub fn init(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        StrataBuilder::new().init(root_path, storage_path)
    }

    /// Open existing storage
    ///
    /// The root path may differ from the one used at initialization, so a
    /// relocated tree can be tracked with the same history.
    #[instrument(skip(storage_path))]
    pub fn open(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        info!("Opening Strata storage at {:?}", storage_path);
        let config_path = storage_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(StrataError::StorageNotInitialized(storage_path));
        }
        let mut config: StrataConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)?;
        config.root_path = canonical_root(&root_path)?;
        config.storage_path = storage_path.canonicalize()?;
        Self::load(config)
    }

    fn load(config: StrataConfig) -> Result<Self> {
        validate(&config)?;
        let store = SledObjectStore::open(&config.storage_path.join(DB_DIR))?;
        let mut db = Database::load(
            Box::new(store),
            &config.storage_path.join(CONTENT_FILE),
            config.compression_level,
            config.chunk_size,
        )?;
        let fs = LocalFileSystem::new(config.local_filesystem_types.clone());

        let mut filter = Filter::new();
        for path in &config.ignore_paths {
            filter.add_ignore(path.clone());
        }
        for path in &config.touch_new_paths {
            filter.add_touch_new_files(path);
        }
        for path in &config.track_dirs_only_paths {
            filter.add_track_dirs_only(path);
        }
        if config.storage_path.starts_with(&config.root_path) {
            debug!("Storage lives inside the tracked tree, ignoring {:?}", config.storage_path);
            filter.add_ignore(config.storage_path.clone());
        }

        let mount_table = match fs.mount_table() {
            Ok(table) => table,
            Err(e) => {
                warn!("Could not read mount table: {}", e);
                Vec::new()
            }
        };
        let added = db.check_filesystems(&mount_table);
        if !added.is_empty() {
            info!("Registered {} new filesystems", added.len());
        }
        if config.ignore_non_local_mounts {
            for (mount_point, local) in &mount_table {
                if !local && mount_point.starts_with(&config.root_path) && mount_point != &config.root_path {
                    debug!("Ignoring non-local mount {:?}", mount_point);
                    filter.add_ignore(mount_point.clone());
                }
            }
        }
        // The root itself may sit on a filesystem the table marks non-local
        let root_mount_local = mount_table
            .iter()
            .filter(|(mount_point, _)| config.root_path.starts_with(mount_point))
            .max_by_key(|(mount_point, _)| mount_point.components().count())
            .is_some_and(|(_, local)| *local);
        if !root_mount_local || db.registry().mount_for(&config.root_path).is_none() {
            let id = db.register_mount(&config.root_path);
            debug!("Tracking root {:?} as filesystem {}", config.root_path, id);
        }
        db.commit()?;

        Ok(Self {
            root_path: config.root_path.clone(),
            config,
            db,
            fs,
            filter,
        })
    }

    /// Tracked directory
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Active configuration
    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Engine state
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Scan the tracked tree and record the changes as a patch
    ///
    /// A scan that finds nothing creates no patch. A scan that fails midway
    /// leaves the patch open; the next scan continues it.
    #[instrument(skip(self))]
    pub fn scan(&mut self) -> Result<ScanSummary> {
        let start = Instant::now();
        let mounts = self.db.registry().mount_table().clone();
        let mut scanner = Scanner::new(&self.fs, self.filter.clone(), &mounts);
        let mut recorder = PatchRecorder::new(LiveUpdater::new(&mut self.db, &self.fs));
        scanner.scan(&self.root_path, &mut recorder)?;
        let mut summary = recorder.into_summary();
        summary.dirs_scanned = scanner.dirs_scanned();
        summary.subtrees_skipped = scanner.subtrees_skipped();
        summary.duration_ms = start.elapsed().as_millis() as u64;
        let stats = self.db.content().compression_stats();
        debug!(
            "Compressed {} streams this session, ratio {:.2}",
            stats.streams_compressed,
            stats.ratio()
        );
        info!(
            "Scan finished: {} added, {} removed, {} dirs added, {} dirs removed, {} metadata, patch {:?}",
            summary.entries_added,
            summary.entries_removed,
            summary.dirs_added,
            summary.dirs_removed,
            summary.metadata_changed,
            summary.completed_patch
        );
        Ok(summary)
    }

    /// Scan the tracked tree into the live tree without recording history
    ///
    /// Only allowed while the chain is empty.
    #[instrument(skip(self))]
    pub fn scan_without_patch(&mut self) -> Result<ScanSummary> {
        if let Some(head) = self.db.chain().head() {
            return Err(StrataError::chain(format!(
                "cannot seed the live tree after patch {}; content stored outside a patch would break the chain",
                head.sequence_number
            )));
        }
        let start = Instant::now();
        let mounts = self.db.registry().mount_table().clone();
        let mut scanner = Scanner::new(&self.fs, self.filter.clone(), &mounts);
        let mut updater = LiveUpdater::new(&mut self.db, &self.fs);
        scanner.scan(&self.root_path, &mut updater)?;
        let mut summary = updater.into_summary();
        summary.dirs_scanned = scanner.dirs_scanned();
        summary.subtrees_skipped = scanner.subtrees_skipped();
        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!("Seeded live tree: {} entries, {} directories", summary.entries_added, summary.dirs_added);
        Ok(summary)
    }

    /// Headers of every patch, oldest first
    pub fn list_patches(&self) -> Vec<Patch> {
        self.db.chain().iter().map(Patch::header).collect()
    }

    /// Patch `sequence_number` including its diff tree
    pub fn get_patch(&self, sequence_number: u64) -> Result<&Patch> {
        self.db
            .chain()
            .get(sequence_number)
            .ok_or(StrataError::PatchNotFound(sequence_number))
    }

    /// Newest patch of the chain
    pub fn chain_head(&self) -> Option<&Patch> {
        self.db.chain().head()
    }

    /// Write completed patch `sequence_number` to a patch file
    pub fn export_patch(&self, sequence_number: u64, dest: &Path) -> Result<PatchFileInfo> {
        patch_file::export_patch(&self.db, sequence_number, dest)
    }

    /// Append the patch carried by a patch file to the chain
    pub fn import_patch(&mut self, src: &Path) -> Result<PatchFileInfo> {
        patch_file::import_patch(&mut self.db, src)
    }

    /// Replay patch `sequence_number` onto `target`
    pub fn apply_patch(&self, sequence_number: u64, target: &Path) -> Result<ApplySummary> {
        PatchApplier::new(&self.db, true).apply(sequence_number, target)
    }

    /// Undo patch `sequence_number` on `target`
    pub fn revert_patch(&self, sequence_number: u64, target: &Path) -> Result<ApplySummary> {
        PatchApplier::new(&self.db, false).apply(sequence_number, target)
    }

    /// Exclude an absolute path from future scans
    pub fn add_ignore(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.filter.add_ignore(path.clone());
        if !self.config.ignore_paths.contains(&path) {
            self.config.ignore_paths.push(path);
        }
        self.save_config()
    }

    /// Store new files under a tracked path as placeholders
    pub fn add_touch_new_files(&mut self, path: &str) -> Result<()> {
        self.filter.add_touch_new_files(path);
        let key = path.trim_matches('/').to_string();
        self.config.track_dirs_only_paths.retain(|p| p != &key);
        if !self.config.touch_new_paths.contains(&key) {
            self.config.touch_new_paths.push(key);
        }
        self.save_config()
    }

    /// Track only directories under a tracked path
    pub fn add_track_dirs_only(&mut self, path: &str) -> Result<()> {
        self.filter.add_track_dirs_only(path);
        let key = path.trim_matches('/').to_string();
        self.config.touch_new_paths.retain(|p| p != &key);
        if !self.config.track_dirs_only_paths.contains(&key) {
            self.config.track_dirs_only_paths.push(key);
        }
        self.save_config()
    }

    /// Check chain linkage and the content store offset law
    ///
    /// With `deep`, every content record is also decompressed.
    #[instrument(skip(self))]
    pub fn verify(&self, deep: bool) -> Result<VerifyReport> {
        self.db.chain().verify()?;
        self.db.index().verify_offsets()?;
        let mut report = VerifyReport {
            patches: self.db.chain().len(),
            records: self.db.index().len(),
            bytes_checked: 0,
        };
        if deep {
            for id in 1..self.db.index().next_content_id() {
                report.bytes_checked += self.db.retrieve_content(id, io::sink())?;
            }
        }
        info!(
            "Verified {} patches, {} content records, {} bytes decompressed",
            report.patches, report.records, report.bytes_checked
        );
        Ok(report)
    }

    fn save_config(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.config)?;
        utils::atomic_write(&self.config.storage_path.join(CONFIG_FILE), json.as_bytes())
    }
}

fn canonical_root(root_path: &Path) -> Result<PathBuf> {
    if !root_path.is_dir() {
        return Err(StrataError::InvalidConfiguration(format!(
            "root path {:?} is not a directory",
            root_path
        )));
    }
    Ok(root_path.canonicalize()?)
}

fn validate(config: &StrataConfig) -> Result<()> {
    if config.compression_level > 9 {
        return Err(StrataError::InvalidConfiguration(format!(
            "compression level {} is outside 0-9",
            config.compression_level
        )));
    }
    if config.chunk_size == 0 {
        return Err(StrataError::InvalidConfiguration("chunk size must be positive".to_string()));
    }
    Ok(())
}

/// Builder for [`Strata`] instances
///
/// # Examples
///
/// ```rust,no_run
/// use strata::StrataBuilder;
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let strata = StrataBuilder::new()
///     .compression_level(9)
///     .touch_new_paths(vec!["var/log".to_string()])
///     .track_dirs_only_paths(vec!["var/cache".to_string()])
///     .build(PathBuf::from("/"), PathBuf::from("/var/lib/strata"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StrataBuilder {
    compression_level: u32,
    chunk_size: usize,
    ignore_non_local_mounts: bool,
    local_filesystem_types: Vec<String>,
    ignore_paths: Vec<PathBuf>,
    touch_new_paths: Vec<String>,
    track_dirs_only_paths: Vec<String>,
}

impl StrataBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ignore_non_local_mounts: true,
            local_filesystem_types: crate::types::default_local_filesystem_types(),
            ignore_paths: Vec::new(),
            touch_new_paths: Vec::new(),
            track_dirs_only_paths: Vec::new(),
        }
    }

    /// Set the zlib compression level (0-9)
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set the chunk size used when streaming content
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Skip mount points whose filesystem is not local
    pub fn ignore_non_local_mounts(mut self, ignore: bool) -> Self {
        self.ignore_non_local_mounts = ignore;
        self
    }

    /// Filesystem types treated as local
    pub fn local_filesystem_types(mut self, types: Vec<String>) -> Self {
        self.local_filesystem_types = types;
        self
    }

    /// Absolute paths excluded from scanning
    pub fn ignore_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.ignore_paths = paths;
        self
    }

    /// Tracked paths whose new files are stored as placeholders
    pub fn touch_new_paths(mut self, paths: Vec<String>) -> Self {
        self.touch_new_paths = paths;
        self
    }

    /// Tracked paths where only directories are tracked
    pub fn track_dirs_only_paths(mut self, paths: Vec<String>) -> Self {
        self.track_dirs_only_paths = paths;
        self
    }

    /// Open the storage if it exists, otherwise initialize it
    pub fn build(self, root_path: PathBuf, storage_path: PathBuf) -> Result<Strata> {
        if storage_path.join(CONFIG_FILE).exists() {
            Strata::open(root_path, storage_path)
        } else {
            self.init(root_path, storage_path)
        }
    }

    /// Initialize fresh storage with this builder's settings
    pub fn init(self, root_path: PathBuf, storage_path: PathBuf) -> Result<Strata> {
        info!("Initializing Strata for {:?}", root_path);
        let root_path = canonical_root(&root_path)?;
        if storage_path.join(CONFIG_FILE).exists() {
            return Err(StrataError::StorageAlreadyExists(storage_path));
        }
        fs::create_dir_all(&storage_path)?;
        let storage_path = storage_path.canonicalize()?;

        let mut config = StrataConfig::new(root_path, storage_path);
        config.compression_level = self.compression_level;
        config.chunk_size = self.chunk_size;
        config.ignore_non_local_mounts = self.ignore_non_local_mounts;
        config.local_filesystem_types = self.local_filesystem_types;
        config.ignore_paths = self.ignore_paths;
        config.touch_new_paths = self.touch_new_paths.iter().map(|p| p.trim_matches('/').to_string()).collect();
        config.track_dirs_only_paths = self
            .track_dirs_only_paths
            .iter()
            .map(|p| p.trim_matches('/').to_string())
            .collect();
        validate(&config)?;

        let json = serde_json::to_string_pretty(&config)?;
        utils::atomic_write(&config.storage_path.join(CONFIG_FILE), json.as_bytes())?;
        info!("Initialized storage at {:?}", config.storage_path);
        Strata::load(config)
    }
}

impl Default for StrataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let storage = dir.path().join("storage");
        fs::create_dir(&root).unwrap();
        (dir, root, storage)
    }

    #[test]
    fn test_init_twice_fails() {
        let (_dir, root, storage) = setup();
        drop(Strata::init(root.clone(), storage.clone()).unwrap());
        assert!(matches!(
            Strata::init(root, storage),
            Err(StrataError::StorageAlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_uninitialized_fails() {
        let (_dir, root, storage) = setup();
        assert!(matches!(
            Strata::open(root, storage),
            Err(StrataError::StorageNotInitialized(_))
        ));
    }

    #[test]
    fn test_invalid_compression_level() {
        let (_dir, root, storage) = setup();
        let err = StrataBuilder::new().compression_level(12).init(root, storage).unwrap_err();
        assert!(matches!(err, StrataError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_filters_persist_across_open() {
        let (_dir, root, storage) = setup();
        {
            let mut strata = Strata::init(root.clone(), storage.clone()).unwrap();
            strata.add_touch_new_files("/spool/").unwrap();
            strata.add_track_dirs_only("cache").unwrap();
            strata.add_ignore(root.join("tmp")).unwrap();
        }
        let strata = StrataBuilder::new().build(root.clone(), storage).unwrap();
        assert_eq!(strata.config().touch_new_paths, vec!["spool".to_string()]);
        assert_eq!(strata.config().track_dirs_only_paths, vec!["cache".to_string()]);
        assert_eq!(strata.config().ignore_paths, vec![root.join("tmp")]);
    }

    #[test]
    fn test_root_is_always_covered_by_a_mount() {
        let (_dir, root, storage) = setup();
        let strata = Strata::init(root, storage).unwrap();
        assert!(strata.database().registry().mount_for(strata.root_path()).is_some());
    }
}
