//! On-disk feature store tying groups, arrays and the journal together.

use crate::array::{ArrayStore, ChunkHint, DirArrayStore};
use crate::error::{Result, StoreError};
use crate::group::{DatasetGroup, WriteOptions};
use crate::items::Item;
use crate::types::{AppendReport, FeatureMatrix, GroupData, ItemFeatures, StoreStats};
use crate::wal::{WalOperation, WriteAheadLog};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Chunk cache size (number of chunks).
    pub chunk_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Chunk sizing for groups created without an explicit hint.
    pub default_chunk_hint: ChunkHint,

    /// fsync every chunk and header write instead of only on `sync`.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./features"),
            chunk_cache_size: 256,
            create_if_missing: true,
            default_chunk_hint: ChunkHint::default(),
            sync_writes: false,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.wal";
const GROUPS_DIR: &str = "groups";

/// Item name used by [`FeatureStore::simple_write`] when none is given.
pub const DEFAULT_ITEM_NAME: &str = "item";

/// A feature store directory.
///
/// Holds an exclusive lock on the directory for its whole lifetime. Each
/// group is a sub-directory with the four arrays `items`, `index`, `times`
/// and `features`.
pub struct FeatureStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    arrays: DirArrayStore,

    journal: WriteAheadLog,

    /// Serializes writes so a journal entry covers exactly one append.
    write_lock: Mutex<()>,
}

impl FeatureStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if !config.create_if_missing {
            Err(StoreError::NotInitialized)
        } else if is_non_empty_dir(&config.path)? {
            Err(StoreError::InvalidFormat(format!(
                "{} is not a feature store",
                config.path.display()
            )))
        } else {
            Self::create(config)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            return Err(StoreError::AlreadyExists(config.path.display().to_string()));
        }
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let arrays = DirArrayStore::new(
            config.path.join(GROUPS_DIR),
            config.chunk_cache_size,
            config.sync_writes,
        )?;
        let journal = WriteAheadLog::open(config.path.join(JOURNAL_FILE))?;

        tracing::info!(
            target: "featurestore::store",
            path = %config.path.display(),
            "created store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            arrays,
            journal,
            write_lock: Mutex::new(()),
        })
    }

    /// Open an existing store, rolling back any append left unfinished.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let arrays = DirArrayStore::new(
            config.path.join(GROUPS_DIR),
            config.chunk_cache_size,
            config.sync_writes,
        )?;
        let journal = WriteAheadLog::open(config.path.join(JOURNAL_FILE))?;

        let store = Self {
            config,
            _lock_file: lock_file,
            arrays,
            journal,
            write_lock: Mutex::new(()),
        };
        store.recover()?;
        Ok(store)
    }

    /// Undo journal entries that never committed, newest first.
    fn recover(&self) -> Result<()> {
        let pending = self.journal.get_pending_entries()?;
        if pending.is_empty() {
            return Ok(());
        }

        for entry in pending.iter().rev() {
            match &entry.operation {
                WalOperation::Append { group, before } => {
                    tracing::warn!(
                        target: "featurestore::store",
                        group = %group,
                        seq = entry.seq,
                        "rolling back unfinished append"
                    );
                    match DatasetGroup::new(&self.arrays, group.as_str())?.truncate(before) {
                        Ok(()) | Err(StoreError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                WalOperation::Create { group } => {
                    tracing::warn!(
                        target: "featurestore::store",
                        group = %group,
                        seq = entry.seq,
                        "removing partially created group"
                    );
                    DatasetGroup::new(&self.arrays, group.as_str())?.remove()?;
                }
                WalOperation::Commit => {}
            }
        }

        self.journal.clear()?;
        tracing::info!(
            target: "featurestore::store",
            entries = pending.len(),
            "journal recovery complete"
        );
        Ok(())
    }

    // --- Write Operations ---

    /// Append items to a group with default options.
    pub fn write<I: Item>(
        &self,
        group: &str,
        items: Vec<I>,
        times: Vec<Vec<f64>>,
        features: Vec<FeatureMatrix>,
    ) -> Result<AppendReport> {
        self.write_with_options(group, items, times, features, &WriteOptions::default())
    }

    /// Append items to a group.
    ///
    /// The append is journaled: if it fails part-way, the group is cut back
    /// to its previous lengths, now or on the next open.
    pub fn write_with_options<I: Item>(
        &self,
        group: &str,
        items: Vec<I>,
        times: Vec<Vec<f64>>,
        features: Vec<FeatureMatrix>,
        options: &WriteOptions,
    ) -> Result<AppendReport> {
        let _lock = self.write_lock.lock();

        let options = WriteOptions {
            chunk_hint: Some(options.chunk_hint.unwrap_or(self.config.default_chunk_hint)),
            ..*options
        };
        let handle = DatasetGroup::new(&self.arrays, group)?;

        let operation = if handle.exists() {
            WalOperation::Append {
                group: group.to_string(),
                before: handle.lengths()?,
            }
        } else if !self.arrays.locations()?.iter().any(|name| name == group) {
            WalOperation::Create {
                group: group.to_string(),
            }
        } else {
            // A directory without a catalog was not made by a committed
            // write; leave it for the caller to inspect or remove.
            return Err(StoreError::AlreadyExists(format!(
                "{}: directory exists without a catalog",
                group
            )));
        };

        let seq = self.journal.log(operation.clone())?;
        match handle.write(items, times, features, &options) {
            Ok(report) => {
                self.journal.commit(seq)?;
                Ok(report)
            }
            Err(e) => Err(self.abandon(&handle, &operation, seq, e)),
        }
    }

    /// Write one item's times and features, named `item` or
    /// [`DEFAULT_ITEM_NAME`].
    pub fn simple_write(
        &self,
        group: &str,
        times: Vec<f64>,
        features: FeatureMatrix,
        item: Option<&str>,
    ) -> Result<AppendReport> {
        let item = item.unwrap_or(DEFAULT_ITEM_NAME).to_string();
        self.write(group, vec![item], vec![times], vec![features])
    }

    /// Undo a failed journaled write and return the write's own error.
    ///
    /// The entry is committed only once the undo succeeded; otherwise it
    /// stays pending and the next open rolls it back.
    fn abandon<S: ArrayStore>(
        &self,
        handle: &DatasetGroup<'_, S>,
        operation: &WalOperation,
        seq: u64,
        error: StoreError,
    ) -> StoreError {
        let settled = undo(handle, operation).and_then(|()| self.journal.commit(seq));
        if let Err(undo_error) = settled {
            tracing::warn!(
                target: "featurestore::store",
                group = %handle.location(),
                seq,
                error = %undo_error,
                "could not undo failed write; left for recovery"
            );
        }
        error
    }

    // --- Read Operations ---

    /// Read every item of a group.
    pub fn read<I: Item>(&self, group: &str) -> Result<GroupData<I>> {
        let handle = DatasetGroup::new(&self.arrays, group)?;
        if !handle.exists() {
            return Err(StoreError::NotFound(group.to_string()));
        }
        handle.read()
    }

    /// Read a single item of a group.
    pub fn read_item<I: Item>(&self, group: &str, item: &I) -> Result<ItemFeatures> {
        let mut data = self.read::<I>(group)?;
        let pos = data
            .items
            .iter()
            .position(|i| i == item)
            .ok_or_else(|| StoreError::NotFound(format!("{:?} in {}", item, group)))?;
        Ok(data.entries.swap_remove(pos))
    }

    /// Names of all groups, sorted.
    pub fn list_groups(&self) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        for name in self.arrays.locations()? {
            if DatasetGroup::new(&self.arrays, name.as_str())?.exists() {
                groups.push(name);
            }
        }
        Ok(groups)
    }

    /// Delete a group and all its data.
    pub fn remove_group(&self, group: &str) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.arrays.remove_location(group)?;
        tracing::info!(target: "featurestore::store", group = %group, "removed group");
        Ok(())
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for group in self.list_groups()? {
            let lengths = DatasetGroup::new(&self.arrays, group.as_str())?.lengths()?;
            stats.group_count += 1;
            stats.item_count += lengths.items;
            stats.frame_count += lengths.times;
            stats.total_size_bytes += self.arrays.location_size(&group)?;
        }
        Ok(stats)
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.arrays.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join(MANIFEST_FILE))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = match File::open(path.join(MANIFEST_FILE)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::InvalidFormat("Missing store manifest".into()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| StoreError::InvalidFormat("Truncated store manifest".into()))?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| StoreError::InvalidFormat("Truncated store manifest".into()))?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for FeatureStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

fn undo<S: ArrayStore>(handle: &DatasetGroup<'_, S>, operation: &WalOperation) -> Result<()> {
    match operation {
        WalOperation::Append { before, .. } => handle.truncate(before),
        WalOperation::Create { .. } => handle.remove(),
        WalOperation::Commit => Ok(()),
    }
}

fn is_non_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::MemoryArrayStore;
    use crate::types::{SubStoreLengths, Verdict};
    use std::num::NonZeroU64;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            chunk_cache_size: 16,
            create_if_missing: true,
            ..Default::default()
        }
    }

    fn one_item(frames: usize, dim: usize) -> (Vec<f64>, FeatureMatrix) {
        let times = (0..frames).map(|f| f as f64).collect();
        let data = (0..frames * dim).map(|v| v as f64 * 0.5).collect();
        (times, FeatureMatrix::new(dim, data).unwrap())
    }

    fn write_items(store: &FeatureStore, group: &str, names: &[&str]) -> Result<AppendReport> {
        let mut times = Vec::new();
        let mut features = Vec::new();
        for _ in names {
            let (t, f) = one_item(3, 2);
            times.push(t);
            features.push(f);
        }
        let items = names.iter().map(|s| s.to_string()).collect();
        store.write(group, items, times, features)
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join("journal.wal").exists());
        assert!(store.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let report = write_items(&store, "mfcc", &["a", "b"]).unwrap();
        assert!(report.created);
        assert_eq!(report.frames_written, 6);

        let data: GroupData<String> = store.read("mfcc").unwrap();
        assert_eq!(data.items, vec!["a", "b"]);
        assert_eq!(data.entries[1].features.dim(), 2);
        assert!(!store.journal.has_pending().unwrap());
    }

    #[test]
    fn test_simple_write_default_item() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let (times, features) = one_item(300, 20);
        store
            .simple_write("f", times.clone(), features.clone(), None)
            .unwrap();

        let item = store.read_item("f", &DEFAULT_ITEM_NAME.to_string()).unwrap();
        assert_eq!(item.times, times);
        assert_eq!(item.features, features);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = FeatureStore::create(config.clone()).unwrap();
            write_items(&store, "g", &["a", "b", "c"]).unwrap();
            store.sync().unwrap();
        }

        let store = FeatureStore::open(config).unwrap();
        let report = write_items(&store, "g", &["c", "d"]).unwrap();
        assert_eq!(report.verdict, Verdict::AppendableWithTrim);

        let data: GroupData<String> = store.read("g").unwrap();
        assert_eq!(data.items, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _store1 = FeatureStore::create(config.clone()).unwrap();

        let result = FeatureStore::open(config);
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        drop(FeatureStore::create(config.clone()).unwrap());
        assert!(FeatureStore::open(config).is_ok());
    }

    #[test]
    fn test_open_missing_store() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            FeatureStore::open_or_create(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_failed_append_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        write_items(&store, "g", &["a", "b"]).unwrap();
        let before = DatasetGroup::new(&store.arrays, "g").unwrap().lengths().unwrap();

        let result = write_items(&store, "g", &["a", "x"]);
        assert!(matches!(result, Err(StoreError::NonContiguousAppend(_))));

        let after = DatasetGroup::new(&store.arrays, "g").unwrap().lengths().unwrap();
        assert_eq!(before, after);
        assert!(!store.journal.has_pending().unwrap());
    }

    #[test]
    fn test_failed_first_write_removes_group() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let (t, f) = one_item(3, 2);
        let result = store.write("g", vec!["a".to_string()], vec![t, vec![0.0]], vec![f]);
        assert!(matches!(result, Err(StoreError::LengthMismatch(_))));
        assert!(store.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_chunk_hint_leaves_no_group() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        // u64::MAX fails on the first array; u32::MAX only on the
        // three-wide features, after the other arrays were created.
        for records in [u64::MAX, u32::MAX as u64] {
            let (t, f) = one_item(2, 3);
            let options = WriteOptions {
                chunk_hint: Some(ChunkHint::Records(NonZeroU64::new(records).unwrap())),
                ..Default::default()
            };
            let result =
                store.write_with_options("g", vec!["a".to_string()], vec![t], vec![f], &options);
            assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
            assert!(store.list_groups().unwrap().is_empty());
            assert!(!store.journal.has_pending().unwrap());
        }

        write_items(&store, "g", &["a"]).unwrap();
        assert_eq!(store.list_groups().unwrap(), vec!["g"]);
    }

    #[test]
    fn test_leftover_directory_is_not_adopted() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let leftover = store.path().join("groups").join("g").join("items");
        fs::create_dir_all(&leftover).unwrap();

        let result = write_items(&store, "g", &["a"]);
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert!(!store.journal.has_pending().unwrap());
        assert!(leftover.exists());
    }

    #[test]
    fn test_failed_undo_keeps_write_error_and_entry() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let operation = WalOperation::Append {
            group: "g".to_string(),
            before: SubStoreLengths {
                items: 1,
                index: 1,
                times: 3,
                features: 3,
            },
        };
        let seq = store.journal.log(operation.clone()).unwrap();

        // Truncating a group that is not there fails.
        let arrays = MemoryArrayStore::new();
        let group = DatasetGroup::new(&arrays, "g").unwrap();
        let error = store.abandon(
            &group,
            &operation,
            seq,
            StoreError::NonContiguousAppend("b".into()),
        );

        assert!(matches!(error, StoreError::NonContiguousAppend(ref item) if item == "b"));
        assert!(store.journal.has_pending().unwrap());
    }

    #[test]
    fn test_successful_undo_commits_entry() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        let arrays = MemoryArrayStore::new();
        let group = DatasetGroup::new(&arrays, "g").unwrap();
        group.create::<String>(ChunkHint::default(), 2).unwrap();
        let operation = WalOperation::Append {
            group: "g".to_string(),
            before: group.lengths().unwrap(),
        };
        let seq = store.journal.log(operation.clone()).unwrap();

        let error = store.abandon(&group, &operation, seq, StoreError::EmptyInput);
        assert!(matches!(error, StoreError::EmptyInput));
        assert!(!store.journal.has_pending().unwrap());
    }

    #[test]
    fn test_recover_rolls_back_pending_append() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let before = {
            let store = FeatureStore::create(config.clone()).unwrap();
            write_items(&store, "g", &["a", "b"]).unwrap();

            // Simulate a crash between journal intent and commit
            let group = DatasetGroup::new(&store.arrays, "g").unwrap();
            let before = group.lengths().unwrap();
            store
                .journal
                .log(WalOperation::Append {
                    group: "g".to_string(),
                    before,
                })
                .unwrap();
            store.arrays.append("g", "times", &[9.0, 9.0]).unwrap();
            store.arrays.append("g", "index", &[8u64]).unwrap();
            before
        };

        let store = FeatureStore::open(config).unwrap();
        let group = DatasetGroup::new(&store.arrays, "g").unwrap();
        assert_eq!(group.lengths().unwrap(), before);
        assert!(!store.journal.has_pending().unwrap());

        let data: GroupData<String> = store.read("g").unwrap();
        assert_eq!(data.items, vec!["a", "b"]);
    }

    #[test]
    fn test_recover_removes_partial_group() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = FeatureStore::create(config.clone()).unwrap();
            store
                .journal
                .log(WalOperation::Create {
                    group: "half".to_string(),
                })
                .unwrap();
            DatasetGroup::new(&store.arrays, "half")
                .unwrap()
                .create::<String>(ChunkHint::default(), 3)
                .unwrap();
        }

        let store = FeatureStore::open(config).unwrap();
        assert!(store.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_remove_group() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        write_items(&store, "a", &["x"]).unwrap();
        write_items(&store, "b", &["x"]).unwrap();
        assert_eq!(store.list_groups().unwrap(), vec!["a", "b"]);

        store.remove_group("a").unwrap();
        assert_eq!(store.list_groups().unwrap(), vec!["b"]);
        assert!(matches!(
            store.read::<String>("a"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();

        write_items(&store, "a", &["x", "y"]).unwrap();
        write_items(&store, "b", &["z"]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.item_count, 3);
        assert_eq!(stats.frame_count, 9);
        assert!(stats.total_size_bytes > 0);
    }

    #[test]
    fn test_truncate_is_noop_when_lengths_match() {
        let dir = TempDir::new().unwrap();
        let store = FeatureStore::create(test_config(&dir)).unwrap();
        write_items(&store, "g", &["a"]).unwrap();

        let group = DatasetGroup::new(&store.arrays, "g").unwrap();
        let lengths = group.lengths().unwrap();
        group.truncate(&lengths).unwrap();
        assert_eq!(
            group.lengths().unwrap(),
            SubStoreLengths {
                items: 1,
                index: 1,
                times: 3,
                features: 3
            }
        );
    }
}
