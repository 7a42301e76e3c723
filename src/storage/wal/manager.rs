//! Redo log manager.
//!
//! Groups are length-prefixed bincode images. With a `wal_dir` they are
//! buffered and written to rotating files; without one they are kept in
//! memory, which is what tests and the demo binary use.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::record::{RedoGroup, RedoRecord, LSN};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuf, PageId};

/// Size of the in-memory log buffer before it is written out (1MB).
const WAL_BUFFER_SIZE: usize = 1024 * 1024;

const WAL_FILE_PREFIX: &str = "redo_";
const WAL_FILE_EXTENSION: &str = ".log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory for redo files; `None` keeps the log in memory.
    pub wal_dir: Option<PathBuf>,
    /// Maximum size of a single redo file in bytes.
    pub max_file_size: u64,
    /// Whether every flush also syncs the file.
    pub sync_on_commit: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: None,
            max_file_size: 64 * 1024 * 1024,
            sync_on_commit: false,
        }
    }
}

struct WalFile {
    file: BufWriter<File>,
    size: u64,
}

impl WalFile {
    fn create(path: PathBuf) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;

        Ok(WalFile {
            file: BufWriter::new(file),
            size: 0,
        })
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

struct LogState {
    current_lsn: LSN,
    flushed_lsn: LSN,
    buffer: Vec<u8>,
    file: Option<WalFile>,
    file_seq: u64,
    /// Retained groups when running without a directory.
    groups: Vec<RedoGroup>,
}

pub struct RedoLog {
    config: WalConfig,
    state: Mutex<LogState>,
}

impl RedoLog {
    pub fn new(config: WalConfig) -> StorageResult<Self> {
        let mut state = LogState {
            current_lsn: LSN::new(),
            flushed_lsn: LSN::new(),
            buffer: Vec::with_capacity(WAL_BUFFER_SIZE),
            file: None,
            file_seq: 0,
            groups: Vec::new(),
        };
        if let Some(dir) = &config.wal_dir {
            std::fs::create_dir_all(dir)?;
            state.file = Some(WalFile::create(Self::file_path(dir, 0))?);
        }
        Ok(RedoLog {
            config,
            state: Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        RedoLog {
            config: WalConfig::default(),
            state: Mutex::new(LogState {
                current_lsn: LSN::new(),
                flushed_lsn: LSN::new(),
                buffer: Vec::new(),
                file: None,
                file_seq: 0,
                groups: Vec::new(),
            }),
        }
    }

    fn file_path(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("{}{:08}{}", WAL_FILE_PREFIX, seq, WAL_FILE_EXTENSION))
    }

    pub fn current_lsn(&self) -> LSN {
        self.state.lock().current_lsn
    }

    pub fn flushed_lsn(&self) -> LSN {
        self.state.lock().flushed_lsn
    }

    /// Appends one mini-transaction's records and returns the group's LSN.
    pub fn append(&self, records: Vec<RedoRecord>) -> StorageResult<LSN> {
        let mut state = self.state.lock();
        let lsn = state.current_lsn.next();
        state.current_lsn = lsn;
        let group = RedoGroup { lsn, records };
        trace!("redo group {} with {} records", lsn, group.records.len());

        if self.config.wal_dir.is_none() {
            state.groups.push(group);
            state.flushed_lsn = lsn;
            return Ok(lsn);
        }

        let serialized = group.serialize()?;
        if state.buffer.len() + 4 + serialized.len() > WAL_BUFFER_SIZE {
            self.flush_locked(&mut state)?;
        }
        state
            .buffer
            .extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        state.buffer.extend_from_slice(&serialized);
        Ok(lsn)
    }

    /// Writes buffered groups to the current file, rotating when it is full.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut LogState) -> StorageResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let dir = match &self.config.wal_dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };

        let needs_rotation = state
            .file
            .as_ref()
            .map_or(true, |f| f.size + state.buffer.len() as u64 > self.config.max_file_size);
        if needs_rotation {
            if let Some(file) = state.file.as_mut() {
                file.sync()?;
            }
            state.file_seq += 1;
            debug!("rotating redo log to file {}", state.file_seq);
            state.file = Some(WalFile::create(Self::file_path(&dir, state.file_seq))?);
        }

        let data = std::mem::take(&mut state.buffer);
        let file = state.file.as_mut().ok_or_else(|| {
            StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "No redo file open"))
        })?;
        file.write(&data)?;
        if self.config.sync_on_commit {
            file.sync()?;
        } else {
            file.file.flush()?;
        }
        state.flushed_lsn = state.current_lsn;
        state.buffer = data;
        state.buffer.clear();
        Ok(())
    }

    /// Groups retained by an in-memory log.
    pub fn groups(&self) -> Vec<RedoGroup> {
        self.state.lock().groups.clone()
    }

    /// Reads every group from a redo file.
    pub fn read_groups_from_file(path: &Path) -> StorageResult<Vec<RedoGroup>> {
        let mut file = File::open(path)?;
        let mut groups = Vec::new();

        loop {
            let mut size_bytes = [0u8; 4];
            match file.read_exact(&mut size_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StorageError::Io(e)),
            }
            let size = u32::from_le_bytes(size_bytes) as usize;
            let mut data = vec![0u8; size];
            file.read_exact(&mut data)?;
            groups.push(RedoGroup::deserialize(&data)?);
        }

        Ok(groups)
    }

    /// Redo files in the log directory, oldest first.
    pub fn log_files(&self) -> StorageResult<Vec<PathBuf>> {
        let dir = match &self.config.wal_dir {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name() {
                let name = name.to_string_lossy();
                if name.starts_with(WAL_FILE_PREFIX) && name.ends_with(WAL_FILE_EXTENSION) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Applies `groups` in order onto `pages`, creating images for pages that
    /// are initialized by the log.
    pub fn replay(groups: &[RedoGroup], pages: &mut HashMap<PageId, PageBuf>) {
        for group in groups {
            for record in &group.records {
                let page = pages
                    .entry(record.page())
                    .or_insert_with(|| PageBuf::new_temp(record.page()));
                record.apply(page);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_rec(page: u32, offset: u16, bytes: &[u8]) -> RedoRecord {
        RedoRecord::Write {
            page: PageId(page),
            offset,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_in_memory_log_assigns_lsns() -> StorageResult<()> {
        let log = RedoLog::in_memory();
        let a = log.append(vec![write_rec(1, 100, &[1])])?;
        let b = log.append(vec![write_rec(1, 101, &[2])])?;
        assert_eq!(a, LSN(1));
        assert_eq!(b, LSN(2));
        assert_eq!(log.groups().len(), 2);
        assert_eq!(log.flushed_lsn(), LSN(2));
        Ok(())
    }

    #[test]
    fn test_file_log_roundtrip() -> StorageResult<()> {
        let dir = TempDir::new()?;
        let log = RedoLog::new(WalConfig {
            wal_dir: Some(dir.path().to_path_buf()),
            max_file_size: 1024 * 1024,
            sync_on_commit: false,
        })?;
        for i in 0..10u16 {
            log.append(vec![write_rec(2, 200 + i, &[i as u8])])?;
        }
        log.flush()?;
        assert_eq!(log.flushed_lsn(), LSN(10));

        let mut groups = Vec::new();
        for file in log.log_files()? {
            groups.extend(RedoLog::read_groups_from_file(&file)?);
        }
        assert_eq!(groups.len(), 10);
        assert_eq!(groups[9].lsn, LSN(10));
        Ok(())
    }

    #[test]
    fn test_replay_rebuilds_pages() {
        let mut page = PageBuf::new(PageId(4));
        page.log_init();
        page.write_u64(500, 99);
        let log = RedoLog::in_memory();
        log.append(page.take_redo()).unwrap();

        let mut pages = HashMap::new();
        RedoLog::replay(&log.groups(), &mut pages);
        assert_eq!(pages[&PageId(4)].read_u64(500), 99);
    }
}
