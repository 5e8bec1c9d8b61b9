//! Record Store
//!
//! Durable, append-only log of [`MintRecord`]s.
//!
//! The main file is a single JSON array. Appends never rewrite it: each record is
//! written as one line to a journal file next to it and synced before the append
//! is acknowledged. A checkpoint folds the journal into the main file through a
//! temp-file rename and then truncates the journal. Journal lines carry their
//! sequence number, so a crash between the rename and the truncation replays
//! nothing twice.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decoder::DecodedInstruction;

/// Default file the records are written to
pub const DEFAULT_STORE_PATH: &str = "minted_tokens_log.json";

/// Appends between two automatic checkpoints
pub const DEFAULT_CHECKPOINT_EVERY: usize = 64;

/// Explorer link prefix used as the transaction reference
pub const EXPLORER_TX_URL: &str = "https://explorer.solana.com/tx/";

/// Explorer prefix for account links
pub const EXPLORER_ADDRESS_URL: &str = "https://explorer.solana.com/address/";

/// Errors that can occur while persisting records
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corruption detected in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Store is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Journal {0} holds a partial write that could not be rolled back")]
    NeedsRecovery(PathBuf),
}

/// One detected token creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MintRecord {
    /// Explorer URL of the creating transaction
    pub transaction_url: String,
    /// Address of the created mint, when it could be resolved
    pub mint_address: Option<String>,
    /// Seconds since the Unix epoch when the creation event was detected
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl MintRecord {
    /// Build a record for a transaction with only a mint address
    pub fn new(transaction_url: impl Into<String>, mint_address: Option<String>) -> Self {
        Self {
            transaction_url: transaction_url.into(),
            mint_address,
            timestamp: current_timestamp_secs(),
            name: None,
            symbol: None,
            uri: None,
        }
    }

    /// Build a record from a decoded creation instruction
    pub fn from_decoded(transaction_url: impl Into<String>, decoded: &DecodedInstruction) -> Self {
        let text = |name: &str| decoded.field(name).map(str::to_string);
        Self {
            name: text("name"),
            symbol: text("symbol"),
            uri: text("uri"),
            ..Self::new(transaction_url, decoded.account("mint").map(str::to_string))
        }
    }
}

/// Explorer URL for a transaction signature
pub fn explorer_url(signature: &str, cluster: &str) -> String {
    format!("{}{}?cluster={}", EXPLORER_TX_URL, signature, cluster)
}

/// Explorer URL for an account address
pub fn explorer_address_url(address: &str, cluster: &str) -> String {
    format!("{}{}?cluster={}", EXPLORER_ADDRESS_URL, address, cluster)
}

/// Current time in fractional seconds since the Unix epoch
pub fn current_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct JournalEntryRef<'a> {
    seq: u64,
    record: &'a MintRecord,
}

#[derive(Deserialize)]
struct JournalEntry {
    seq: u64,
    record: MintRecord,
}

struct StoreInner {
    records: Vec<MintRecord>,
    references: HashSet<String>,
    journal: File,
    journal_len: u64,
    since_checkpoint: usize,
    /// Set when a partial journal write could not be cut off
    needs_recovery: bool,
}

/// Crash-safe append-only record store
pub struct RecordStore {
    path: PathBuf,
    journal_path: PathBuf,
    checkpoint_every: usize,
    inner: Mutex<StoreInner>,
}

impl RecordStore {
    /// Open (or create) a store with the default checkpoint interval
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, DEFAULT_CHECKPOINT_EVERY)
    }

    /// Open (or create) a store
    ///
    /// Loads the main file, replays the journal and takes an exclusive lock on
    /// the journal for the lifetime of the store.
    pub fn open_with(path: impl AsRef<Path>, checkpoint_every: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let journal = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&journal_path)?;
        journal
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked(journal_path.clone()))?;

        let mut records = load_main(&path)?;
        let committed = records.len();
        let (replayed, journal_len) = replay_journal(&journal, &journal_path, &mut records)?;

        let references = records.iter().map(|r| r.transaction_url.clone()).collect();
        let store = Self {
            path,
            journal_path,
            checkpoint_every: checkpoint_every.max(1),
            inner: Mutex::new(StoreInner {
                records,
                references,
                journal,
                journal_len,
                since_checkpoint: replayed,
                needs_recovery: false,
            }),
        };

        info!(
            "Opened record store at {} ({} committed, {} replayed from journal)",
            store.path.display(),
            committed,
            replayed
        );
        if replayed > 0 {
            store.checkpoint()?;
        }
        Ok(store)
    }

    /// Append a record
    ///
    /// The record is synced to the journal before this returns. After a failed
    /// rollback, appends are refused until a checkpoint has replaced the journal.
    ///
    /// # Returns
    /// The record's position in the log
    pub fn append(&self, record: MintRecord) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        if inner.needs_recovery {
            if let Err(e) = self.checkpoint_locked(&mut inner) {
                warn!("Recovery checkpoint of {} failed: {}", self.path.display(), e);
                return Err(StoreError::NeedsRecovery(self.journal_path.clone()));
            }
            info!("Recovered journal {} by checkpoint", self.journal_path.display());
        }
        let seq = inner.records.len() as u64;

        let mut line = serde_json::to_vec(&JournalEntryRef { seq, record: &record })?;
        line.push(b'\n');

        if let Err(e) = write_synced(&mut inner.journal, &line) {
            // Drop any partial line so the next append starts on a clean boundary
            if let Err(rollback) = inner.journal.set_len(inner.journal_len) {
                warn!("Failed to roll back journal after write error: {}", rollback);
                inner.needs_recovery = true;
            }
            return Err(e.into());
        }
        inner.journal_len += line.len() as u64;
        inner.references.insert(record.transaction_url.clone());
        inner.records.push(record);
        inner.since_checkpoint += 1;

        if inner.since_checkpoint >= self.checkpoint_every {
            // The record is already durable in the journal
            if let Err(e) = self.checkpoint_locked(&mut inner) {
                warn!("Checkpoint of {} failed: {}", self.path.display(), e);
            }
        }
        Ok(seq)
    }

    /// Fold the journal into the main file
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.checkpoint_locked(&mut inner)
    }

    fn checkpoint_locked(&self, inner: &mut StoreInner) -> Result<(), StoreError> {
        if inner.since_checkpoint == 0 && !inner.needs_recovery && self.path.exists() {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &inner.records)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        inner.journal.set_len(0)?;
        inner.journal.sync_all()?;
        inner.journal_len = 0;
        inner.needs_recovery = false;
        debug!(
            "Checkpointed {} records into {}",
            inner.records.len(),
            self.path.display()
        );
        inner.since_checkpoint = 0;
        Ok(())
    }

    /// Snapshot of every record, in append order
    pub fn records(&self) -> Vec<MintRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a record with this transaction reference was already appended
    pub fn contains(&self, transaction_url: &str) -> bool {
        self.inner.lock().references.contains(transaction_url)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }
}

/// Where a session puts the records it produces
pub trait RecordSink: Send + Sync {
    /// Durably append a record, returning its position in the log
    fn append(&self, record: MintRecord) -> Result<u64, StoreError>;

    fn contains(&self, transaction_url: &str) -> bool;

    fn checkpoint(&self) -> Result<(), StoreError>;
}

impl RecordSink for RecordStore {
    fn append(&self, record: MintRecord) -> Result<u64, StoreError> {
        RecordStore::append(self, record)
    }

    fn contains(&self, transaction_url: &str) -> bool {
        RecordStore::contains(self, transaction_url)
    }

    fn checkpoint(&self) -> Result<(), StoreError> {
        RecordStore::checkpoint(self)
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Err(e) = FileExt::unlock(&inner.journal) {
            debug!("Failed to release store lock: {}", e);
        }
    }
}

/// Journal file that belongs to a main file
pub fn journal_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".journal");
    path.with_file_name(name)
}

fn write_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_data()
}

fn load_main(path: &Path) -> Result<Vec<MintRecord>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Replay journal entries not yet folded into `records`
///
/// Returns the number of replayed entries and the journal length that remains
/// valid. A torn final line is cut off.
fn replay_journal(
    journal: &File,
    journal_path: &Path,
    records: &mut Vec<MintRecord>,
) -> Result<(usize, u64), StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: journal_path.to_path_buf(),
        reason,
    };

    let mut reader = BufReader::new(journal.try_clone()?);
    let mut replayed = 0usize;
    let mut valid_len = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        let complete = line.last() == Some(&b'\n');
        let entry = match serde_json::from_slice::<JournalEntry>(&line) {
            Ok(entry) if complete => entry,
            Ok(_) | Err(_) => {
                // Only the final line may be damaged; anything after it is corruption
                let mut rest = Vec::new();
                std::io::Read::read_to_end(&mut reader, &mut rest)?;
                if !rest.is_empty() {
                    return Err(corrupt(format!("unreadable entry at byte {}", valid_len)));
                }
                warn!(
                    "Truncating torn journal tail ({} bytes) in {}",
                    read,
                    journal_path.display()
                );
                journal.set_len(valid_len)?;
                break;
            }
        };

        let expected = records.len() as u64;
        if entry.seq < expected {
            // Already folded into the main file by an interrupted checkpoint
        } else if entry.seq == expected {
            records.push(entry.record);
            replayed += 1;
        } else {
            return Err(corrupt(format!(
                "sequence gap: expected {}, found {}",
                expected, entry.seq
            )));
        }
        valid_len += read as u64;
    }
    Ok((replayed, valid_len))
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!("Failed to sync directory {}: {}", parent.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
