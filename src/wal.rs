//! Write-ahead journal for group appends.
//!
//! Before a group append touches any sub-store, the lengths of the four
//! sub-stores are logged. A successful append is then marked committed.
//! An entry still pending when the store is reopened names a group whose
//! sub-stores may be out of step; the store truncates them back to the
//! logged lengths.

use crate::error::{Result, StoreError};
use crate::types::SubStoreLengths;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current journal format version.
const WAL_VERSION: u8 = 1;

/// Length of magic plus version.
const HEADER_LEN: u64 = 5;

/// Upper bound on a single encoded entry.
const MAX_ENTRY_LEN: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryStatus {
    Pending,
    Committed,
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub status: WalEntryStatus,
    pub operation: WalOperation,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Operations recorded in the journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    /// An append to `group` is about to start; `before` holds the
    /// sub-store lengths to restore if it never commits.
    Append {
        group: String,
        before: SubStoreLengths,
    },
    /// `group` is about to be created; it is removed if the write never
    /// commits.
    Create { group: String },
    /// Commit marker for an earlier entry.
    Commit,
}

/// Journal backed by a single append-only file.
pub struct WriteAheadLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl WriteAheadLog {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            Self::read_header(&mut reader)?;

            // A torn tail entry ends the scan
            let mut max_seq = 0u64;
            while let Ok(entry) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
            }
            max_seq + 1
        } else {
            Self::write_header(&path)?;
            1
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Log a write intent. Returns its sequence number.
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        self.write(WalEntry {
            seq,
            status: WalEntryStatus::Pending,
            operation,
            timestamp: now_secs(),
        })?;

        tracing::debug!(target: "featurestore::wal", seq, "logged journal entry");
        Ok(seq)
    }

    /// Mark an entry as committed.
    pub fn commit(&self, seq: u64) -> Result<()> {
        self.write(WalEntry {
            seq,
            status: WalEntryStatus::Committed,
            operation: WalOperation::Commit,
            timestamp: now_secs(),
        })
    }

    /// All entries logged but never committed, in sequence order.
    pub fn get_pending_entries(&self) -> Result<Vec<WalEntry>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut reader = BufReader::new(file);
        let mut pending = BTreeMap::new();
        let mut committed = HashSet::new();

        while let Ok(entry) = Self::read_entry(&mut reader) {
            match entry.status {
                WalEntryStatus::Committed => {
                    committed.insert(entry.seq);
                }
                WalEntryStatus::Pending => {
                    pending.insert(entry.seq, entry);
                }
            }
        }

        Ok(pending
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Drop every entry and restart sequence numbers at 1.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        Self::write_header(&self.path)?;
        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *self.next_seq.lock() = 1;

        tracing::debug!(target: "featurestore::wal", "journal cleared");
        Ok(())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.get_pending_entries()?.is_empty())
    }

    fn write(&self, entry: WalEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .ok_or_else(|| StoreError::InvalidArgument("journal is closed".into()))?;
        Self::write_entry(w, &entry)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_entry(writer: &mut impl Write, entry: &WalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_entry(reader: &mut impl Read) -> Result<WalEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_LEN {
            return Err(StoreError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
