//! Summary: In-memory storage engine with fault injection.
//! Copyright (c) YOAB. All rights reserved.
//!
//! `MemoryBackend` keeps every key in an ordered map. It records how writes
//! arrive (single puts vs batches) and can be told to fail or stall, which is
//! what the write stream tests use to observe flush coalescing, open delays
//! and error propagation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::operation::Operation;

/// Injected failures and delays.
#[derive(Debug, Default)]
struct Faults {
    /// Fail every open attempt.
    fail_open: bool,
    /// Number of upcoming open attempts that fail.
    failing_opens: usize,
    /// Number of upcoming writes (put, delete or batch) that fail.
    failing_writes: usize,
    /// Delay applied inside `open`.
    open_latency: Duration,
    /// Delay applied inside every write.
    write_latency: Duration,
}

/// An ordered in-memory key-value engine.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    faults: Mutex<Faults>,
    opened: AtomicBool,
    /// Sizes of every applied write call, in arrival order.
    write_log: Mutex<Vec<usize>>,
    put_calls: AtomicU64,
    batch_calls: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `open` fail.
    pub fn fail_open(&self) {
        self.faults.lock().fail_open = true;
    }

    /// Makes the next `count` open attempts fail; later attempts succeed.
    pub fn fail_next_opens(&self, count: usize) {
        self.faults.lock().failing_opens = count;
    }

    /// Makes the next `count` write calls fail without applying anything.
    pub fn fail_next_writes(&self, count: usize) {
        self.faults.lock().failing_writes = count;
    }

    /// Delays every `open` by `latency`.
    pub fn set_open_latency(&self, latency: Duration) {
        self.faults.lock().open_latency = latency;
    }

    /// Delays every write call by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.faults.lock().write_latency = latency;
    }

    /// Returns true once `open` has succeeded.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of single-key write calls applied (puts and deletes).
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Number of batch write calls applied.
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::Relaxed)
    }

    /// Operation count of every applied write call, in arrival order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_log.lock().clone()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Sleeps for the configured write latency, then consumes one pending
    /// write failure if any.
    fn before_write(&self) -> Result<()> {
        let latency = {
            let mut faults = self.faults.lock();
            if faults.failing_writes > 0 {
                faults.failing_writes -= 1;
                return Err(Error::FaultInjected("write"));
            }
            faults.write_latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }

    fn apply(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: &Operation) {
        match op {
            Operation::Put { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            Operation::Delete { key } => {
                map.remove(key);
            }
        }
    }
}

impl Backend for MemoryBackend {
    fn open(&self) -> Result<()> {
        let (fail, latency) = {
            let mut faults = self.faults.lock();
            let once = faults.failing_opens > 0;
            if once {
                faults.failing_opens -= 1;
            }
            (faults.fail_open || once, faults.open_latency)
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if fail {
            return Err(Error::FaultInjected("open"));
        }
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.before_write()?;
        self.map.write().insert(key.to_vec(), value.to_vec());
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().push(1);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.before_write()?;
        self.map.write().remove(key);
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().push(1);
        Ok(())
    }

    fn write_batch(&self, ops: &[Operation]) -> Result<()> {
        self.before_write()?;
        {
            let mut map = self.map.write();
            for op in ops {
                Self::apply(&mut map, op);
            }
        }
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().push(ops.len());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::Release);
        Ok(())
    }
}
