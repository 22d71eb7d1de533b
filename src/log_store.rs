//! Summary: Append-only on-disk storage engine.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A `LogBackend` lives in a directory and keeps a single record log
//! (`data.log`). Every put, delete or batch is appended as one checksummed
//! record; the full key space is rebuilt in memory on open by replaying the
//! log. A torn or corrupt tail is truncated on replay.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::record::LogRecord;

/// File name of the record log inside the database directory.
pub const LOG_FILE_NAME: &str = "data.log";

/// Options controlling how a database location is opened.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Create the database if the location holds none.
    pub create_if_missing: bool,
    /// Refuse to open a location that already holds a database.
    pub error_if_exists: bool,
    /// fdatasync the log after every write.
    pub sync: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            sync: false,
        }
    }
}

struct LogState {
    file: Option<File>,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Offset one past the last valid record.
    end_offset: u64,
}

/// A durable engine backed by an append-only record log.
pub struct LogBackend {
    dir: PathBuf,
    options: DatabaseOptions,
    state: Mutex<LogState>,
}

impl LogBackend {
    /// Creates a backend rooted at `location`. Nothing touches the disk
    /// until `open`.
    pub fn new<P: AsRef<Path>>(location: P, options: DatabaseOptions) -> Self {
        Self {
            dir: location.as_ref().to_path_buf(),
            options,
            state: Mutex::new(LogState {
                file: None,
                map: BTreeMap::new(),
                end_offset: 0,
            }),
        }
    }

    /// Returns the database directory.
    pub fn location(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the record log.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Rebuilds the key space from the log, truncating an invalid tail.
    fn replay(file: &mut File, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<u64> {
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let mut offset = 0usize;
        let mut records = 0u64;
        while offset < data.len() {
            match LogRecord::decode(&data[offset..], offset as u64) {
                Ok((record, consumed)) => {
                    for op in record.into_operations() {
                        apply(map, op);
                    }
                    offset += consumed;
                    records += 1;
                }
                Err(e) => {
                    warn!(
                        offset,
                        discarded = data.len() - offset,
                        error = %e,
                        "truncating invalid log tail"
                    );
                    file.set_len(offset as u64)?;
                    break;
                }
            }
        }

        info!(records, keys = map.len(), "replayed record log");
        Ok(offset as u64)
    }

    /// Appends one record and applies it to the in-memory key space.
    fn append(&self, record: LogRecord) -> Result<()> {
        let encoded = record.encode()?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let file = state.file.as_mut().ok_or(Error::NotOpen)?;

        file.seek(SeekFrom::Start(state.end_offset))?;
        file.write_all(&encoded)?;
        if self.options.sync {
            fdatasync(file)?;
        }
        state.end_offset += encoded.len() as u64;

        for op in record.into_operations() {
            apply(&mut state.map, op);
        }
        Ok(())
    }
}

fn apply(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: Operation) {
    match op {
        Operation::Put { key, value } => {
            map.insert(key, value);
        }
        Operation::Delete { key } => {
            map.remove(&key);
        }
    }
}

/// Performs fdatasync on Unix systems, falling back to sync_all elsewhere.
#[inline]
fn fdatasync(file: &File) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
        let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        file.sync_all().map_err(Error::Io)
    }
}

impl Backend for LogBackend {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.file.is_some() {
            return Ok(());
        }

        let path = self.log_path();
        let exists = path.exists();
        if exists && self.options.error_if_exists {
            return Err(Error::DatabaseExists {
                path: self.dir.clone(),
            });
        }
        if !exists && !self.options.create_if_missing {
            return Err(Error::DatabaseMissing {
                path: self.dir.clone(),
            });
        }

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut map = BTreeMap::new();
        let end_offset = Self::replay(&mut file, &mut map)?;

        debug!(path = %path.display(), end_offset, "opened record log");
        state.map = map;
        state.end_offset = end_offset;
        state.file = Some(file);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        if state.file.is_none() {
            return Err(Error::NotOpen);
        }
        Ok(state.map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(LogRecord::Single(Operation::put(key, value)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.append(LogRecord::Single(Operation::delete(key)))
    }

    fn write_batch(&self, ops: &[Operation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.append(LogRecord::Batch(ops.to_vec()))
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.file.take() {
            if self.options.sync {
                fdatasync(&file)?;
            }
            debug!(path = %self.log_path().display(), "closed record log");
        }
        state.map.clear();
        state.end_offset = 0;
        Ok(())
    }
}
