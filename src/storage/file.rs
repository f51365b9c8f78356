// File-backed storage backend.
//
// Layout under the storage directory:
//
//   meta.bin          bincode MetaRecord { current_term, voted_for }
//   snapshot.bin      opaque snapshot blob
//   log/<%016x>       one bincode LogEntry per file, keyed by index
//
// Every write goes through a temp file, fsync, and rename, followed by a
// directory fsync, so a setter that returned Ok survives a crash.

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::raft::{LogIndex, NodeId, Term};
use crate::storage::Storage;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const META_FILE: &str = "meta.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const LOG_DIR: &str = "log";

#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
struct MetaRecord {
    current_term: Term,
    voted_for: Option<NodeId>,
}

#[derive(Debug)]
struct FileInner {
    meta: MetaRecord,
    indices: BTreeSet<LogIndex>,
}

#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    inner: RwLock<FileInner>,
}

impl FileStorage {
    /// Open (or create) a storage directory and load its index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(LOG_DIR))?;

        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.exists() {
            let bytes = fs::read(&meta_path)?;
            let (meta, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RaftError::Storage(format!("corrupt meta record: {e}")))?;
            meta
        } else {
            MetaRecord::default()
        };

        let mut indices = BTreeSet::new();
        for dir_entry in fs::read_dir(dir.join(LOG_DIR))? {
            let name = dir_entry?.file_name();
            if let Some(index) = name.to_str().and_then(|s| LogIndex::from_str_radix(s, 16).ok()) {
                indices.insert(index);
            }
        }

        Ok(Self { dir, inner: RwLock::new(FileInner { meta, indices }) })
    }

    fn entry_path(&self, index: LogIndex) -> PathBuf {
        self.dir.join(LOG_DIR).join(format!("{index:016x}"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        self.sync_dir(path.parent().unwrap_or(&self.dir))?;
        Ok(())
    }

    fn sync_dir(&self, dir: &Path) -> Result<()> {
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    fn persist_meta(&self, meta: &MetaRecord) -> Result<()> {
        let bytes = bincode::encode_to_vec(meta, bincode::config::standard())?;
        self.write_atomic(&self.dir.join(META_FILE), &bytes)
    }
}

impl Storage for FileStorage {
    fn current_term(&self) -> Result<Term> {
        Ok(self.inner.read().meta.current_term)
    }

    fn set_current_term(&self, term: Term) -> Result<()> {
        let mut inner = self.inner.write();
        let mut meta = inner.meta.clone();
        meta.current_term = term;
        self.persist_meta(&meta)?;
        inner.meta = meta;
        Ok(())
    }

    fn voted_for(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.read().meta.voted_for.clone())
    }

    fn set_voted_for(&self, id: Option<&NodeId>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut meta = inner.meta.clone();
        meta.voted_for = id.cloned();
        self.persist_meta(&meta)?;
        inner.meta = meta;
        Ok(())
    }

    fn first_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().indices.first().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().indices.last().copied().unwrap_or(0))
    }

    fn log_entry(&self, index: LogIndex) -> Result<LogEntry> {
        if !self.inner.read().indices.contains(&index) {
            return Err(RaftError::LogNotFound(index));
        }
        let bytes = fs::read(self.entry_path(index))?;
        let (entry, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| RaftError::Storage(format!("corrupt log entry {index}: {e}")))?;
        Ok(entry)
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        let mut expected = match inner.indices.last() {
            Some(last) => last + 1,
            None => entries[0].index,
        };
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::InvalidState(format!(
                    "non-contiguous log append: expected {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        for entry in entries {
            let bytes = bincode::encode_to_vec(entry, bincode::config::standard())?;
            self.write_atomic(&self.entry_path(entry.index), &bytes)?;
            inner.indices.insert(entry.index);
        }
        Ok(())
    }

    fn delete_range(&self, min: LogIndex, max: LogIndex) -> Result<()> {
        if min > max {
            return Err(RaftError::InvalidLogRange(min, max));
        }
        let mut inner = self.inner.write();
        let doomed: Vec<LogIndex> = inner.indices.range(min..=max).copied().collect();
        for index in doomed {
            fs::remove_file(self.entry_path(index))?;
            inner.indices.remove(&index);
        }
        self.sync_dir(&self.dir.join(LOG_DIR))?;
        Ok(())
    }

    fn store_snapshot(&self, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.dir.join(SNAPSHOT_FILE), data)
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}
