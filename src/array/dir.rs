//! Directory-backed array store.
//!
//! Layout under the root:
//!
//! ```text
//! <location>/ATTRS.json
//! <location>/<array>/ARRAY
//! <location>/<array>/chunk-00000000.bin
//! ```

use super::chunk::{self, ChunkBackend};
use super::{validate_name, ArraySpec, ArrayStore, Element};
use crate::error::{Result, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for array headers.
const ARRAY_MAGIC: &[u8; 4] = b"ARR\0";

/// Current array header version.
const ARRAY_VERSION: u8 = 1;

const HEADER_FILE: &str = "ARRAY";
const ATTRS_FILE: &str = "ATTRS.json";

/// Array store keeping one directory per array and one file per chunk.
pub struct DirArrayStore {
    /// Root directory holding all locations.
    root: PathBuf,

    /// Encoded chunks by file path.
    cache: Mutex<LruCache<PathBuf, Vec<u8>>>,

    /// fsync every header and chunk write.
    sync_writes: bool,
}

impl DirArrayStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>, cache_size: usize, sync_writes: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(cache_size)),
            sync_writes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Total bytes of all files under one location.
    pub fn location_size(&self, location: &str) -> Result<u64> {
        validate_name("location", location)?;
        dir_size(&self.root.join(location))
    }

    /// Flush every file under the root to disk.
    pub fn sync(&self) -> Result<()> {
        sync_dir(&self.root)
    }

    fn location_path(&self, location: &str) -> Result<PathBuf> {
        validate_name("location", location)?;
        Ok(self.root.join(location))
    }

    fn array_path(&self, location: &str, name: &str) -> Result<PathBuf> {
        validate_name("array", name)?;
        Ok(self.location_path(location)?.join(name))
    }

    fn chunks<'a>(&'a self, dir: PathBuf) -> DirChunks<'a> {
        DirChunks {
            dir,
            cache: &self.cache,
            sync_writes: self.sync_writes,
        }
    }

    fn read_header(&self, dir: &Path, location: &str, name: &str) -> Result<ArraySpec> {
        let mut file = match File::open(dir.join(HEADER_FILE)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{}/{}", location, name)));
            }
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ARRAY_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid array magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ARRAY_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported array version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    /// Write the header through a temporary file so a torn write never
    /// replaces a valid header.
    fn write_header(&self, dir: &Path, spec: &ArraySpec) -> Result<()> {
        let encoded = rmp_serde::to_vec(spec)?;

        let tmp_path = dir.join(format!("{}.tmp", HEADER_FILE));
        let mut file = File::create(&tmp_path)?;
        file.write_all(ARRAY_MAGIC)?;
        file.write_all(&[ARRAY_VERSION])?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, dir.join(HEADER_FILE))?;
        Ok(())
    }

    fn forget_cached_under(&self, dir: &Path) {
        let mut cache = self.cache.lock();
        let stale: Vec<PathBuf> = cache
            .iter()
            .filter(|(path, _)| path.starts_with(dir))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            cache.pop(&path);
        }
    }
}

impl ArrayStore for DirArrayStore {
    fn create_array(&self, location: &str, name: &str, spec: ArraySpec) -> Result<()> {
        let dir = self.array_path(location, name)?;
        if dir.join(HEADER_FILE).exists() {
            return Err(StoreError::AlreadyExists(format!("{}/{}", location, name)));
        }

        fs::create_dir_all(&dir)?;
        self.write_header(&dir, &ArraySpec { len: 0, ..spec })
    }

    fn resize_array(&self, location: &str, name: &str, new_len: u64) -> Result<()> {
        let dir = self.array_path(location, name)?;
        let mut spec = self.read_header(&dir, location, name)?;
        if spec.len == new_len {
            return Ok(());
        }

        chunk::truncate_records(&mut self.chunks(dir.clone()), &spec, new_len)?;
        spec.len = new_len;
        self.write_header(&dir, &spec)
    }

    fn write_range<T: Element>(
        &self,
        location: &str,
        name: &str,
        start: u64,
        values: &[T],
    ) -> Result<()> {
        let dir = self.array_path(location, name)?;
        let spec = self.read_header(&dir, location, name)?;
        chunk::write_records(&mut self.chunks(dir), &spec, start, values)
    }

    fn read_all<T: Element>(&self, location: &str, name: &str) -> Result<Vec<T>> {
        let dir = self.array_path(location, name)?;
        let spec = self.read_header(&dir, location, name)?;
        chunk::read_records(&mut self.chunks(dir), &spec)
    }

    fn array_spec(&self, location: &str, name: &str) -> Result<ArraySpec> {
        let dir = self.array_path(location, name)?;
        self.read_header(&dir, location, name)
    }

    fn contains(&self, location: &str, name: &str) -> bool {
        self.array_path(location, name)
            .map(|dir| dir.join(HEADER_FILE).exists())
            .unwrap_or(false)
    }

    fn set_attribute(&self, location: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let dir = self.location_path(location)?;
        fs::create_dir_all(&dir)?;

        let mut attrs = self.attributes(location)?;
        attrs.insert(key.to_string(), value);

        let mut file = File::create(dir.join(ATTRS_FILE))?;
        file.write_all(&serde_json::to_vec_pretty(&attrs)?)?;
        if self.sync_writes {
            file.sync_all()?;
        }
        Ok(())
    }

    fn attributes(&self, location: &str) -> Result<BTreeMap<String, serde_json::Value>> {
        let path = self.location_path(location)?.join(ATTRS_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_location(&self, location: &str) -> Result<()> {
        let dir = self.location_path(location)?;
        if !dir.exists() {
            return Err(StoreError::NotFound(location.to_string()));
        }
        self.forget_cached_under(&dir);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn locations(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Chunk files of one array directory.
struct DirChunks<'a> {
    dir: PathBuf,
    cache: &'a Mutex<LruCache<PathBuf, Vec<u8>>>,
    sync_writes: bool,
}

impl DirChunks<'_> {
    fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("chunk-{:08}.bin", index))
    }
}

impl ChunkBackend for DirChunks<'_> {
    fn load_chunk(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(index);
        if let Some(bytes) = self.cache.lock().get(&path).cloned() {
            return Ok(Some(bytes));
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            target: "featurestore::array",
            chunk = %path.display(),
            bytes = bytes.len(),
            "chunk cache miss"
        );

        self.cache.lock().put(path, bytes.clone());
        Ok(Some(bytes))
    }

    fn store_chunk(&mut self, index: u64, bytes: Vec<u8>) -> Result<()> {
        let path = self.chunk_path(index);
        let mut file = File::create(&path)?;
        file.write_all(&bytes)?;
        if self.sync_writes {
            file.sync_all()?;
        }

        self.cache.lock().put(path, bytes);
        Ok(())
    }

    fn remove_chunk(&mut self, index: u64) -> Result<()> {
        let path = self.chunk_path(index);
        self.cache.lock().pop(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    if !path.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn sync_dir(path: &Path) -> Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            sync_dir(&entry.path())?;
        } else {
            File::open(entry.path())?.sync_all()?;
        }
    }
    Ok(())
}
