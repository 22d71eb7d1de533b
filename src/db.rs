//! Summary: Database handle with asynchronous open/close lifecycle.
//! Copyright (c) YOAB. All rights reserved.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::log_store::{DatabaseOptions, LogBackend};
use crate::memory::MemoryBackend;
use crate::operation::Operation;
use crate::stream::{WriteStream, WriteStreamOptions};

/// Lifecycle of a [`Database`] handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbStatus {
    /// Created, `open` not called yet.
    New,
    /// The backend is opening.
    Opening,
    /// Ready for reads and writes.
    Open,
    /// The last open attempt failed.
    OpenFailed(String),
    /// Closed by the caller.
    Closed,
}

/// Result of one `open` attempt, as seen by [`Database::open_events`].
pub type OpenOutcome = std::result::Result<(), String>;

/// Open attempts buffered per subscriber before it lags.
const OPEN_EVENT_CAPACITY: usize = 16;

/// The main database handle.
///
/// A `Database` wraps a storage [`Backend`] and exposes it asynchronously:
/// every backend call runs on tokio's blocking pool. Handles are created
/// unopened; `open` may be called after write streams have been bound to
/// the handle, and those streams buffer until it completes.
///
/// # Concurrency
///
/// Handles are shared as `Arc<Database>`. Concurrent `open` calls are
/// serialized so the backend opens once.
pub struct Database {
    backend: Arc<dyn Backend>,
    status: watch::Sender<DbStatus>,
    opens: broadcast::Sender<OpenOutcome>,
    open_lock: AsyncMutex<()>,
}

impl Database {
    /// Creates an unopened handle over `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        let (status, _) = watch::channel(DbStatus::New);
        let (opens, _) = broadcast::channel(OPEN_EVENT_CAPACITY);
        Arc::new(Self {
            backend,
            status,
            opens,
            open_lock: AsyncMutex::new(()),
        })
    }

    /// Creates an unopened handle over a fresh in-memory backend.
    pub fn memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Creates an unopened handle over an on-disk database at `location`.
    pub fn create<P: AsRef<Path>>(location: P, options: DatabaseOptions) -> Arc<Self> {
        Self::new(Arc::new(LogBackend::new(location, options)))
    }

    /// Returns the current lifecycle status.
    pub fn status(&self) -> DbStatus {
        self.status.borrow().clone()
    }

    /// Returns true if the handle is open.
    pub fn is_open(&self) -> bool {
        matches!(*self.status.borrow(), DbStatus::Open)
    }

    /// Opens the backend.
    ///
    /// Returns immediately if the handle is already open. A closed handle
    /// can be opened again.
    ///
    /// # Errors
    ///
    /// Returns `OpenFailed` if the backend cannot be opened; everything
    /// waiting on this handle observes the same failure.
    pub async fn open(&self) -> Result<()> {
        let _guard = self.open_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }

        self.status.send_replace(DbStatus::Opening);
        let backend = Arc::clone(&self.backend);
        let result = match tokio::task::spawn_blocking(move || backend.open()).await {
            Ok(result) => result,
            Err(e) => Err(Error::from(e)),
        };

        // No receivers is fine; the send result is ignored.
        match result {
            Ok(()) => {
                info!("database opened");
                self.status.send_replace(DbStatus::Open);
                let _ = self.opens.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                let err = Error::open(&e);
                warn!(error = %err, "database open failed");
                if let Error::OpenFailed { reason } = &err {
                    self.status.send_replace(DbStatus::OpenFailed(reason.clone()));
                    let _ = self.opens.send(Err(reason.clone()));
                }
                Err(err)
            }
        }
    }

    /// Subscribes to the outcome of every `open` attempt finished from now
    /// on, in order.
    ///
    /// An attempt that returns early because the handle is already open
    /// publishes nothing; check [`is_open`](Self::is_open) after
    /// subscribing.
    pub fn open_events(&self) -> broadcast::Receiver<OpenOutcome> {
        self.opens.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.status.borrow() {
            DbStatus::Open => Ok(()),
            DbStatus::Closed => Err(Error::DatabaseClosed),
            _ => Err(Error::NotOpen),
        }
    }

    /// Runs a backend call on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(backend.as_ref())).await?
    }

    /// Retrieves the value associated with `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key does not exist.
    pub async fn get(&self, key: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let key = key.into();
        self.run(move |backend| backend.get(&key))
            .await?
            .ok_or(Error::NotFound)
    }

    /// Inserts or updates a key-value pair.
    pub async fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.run(move |backend| backend.put(&key, &value)).await
    }

    /// Deletes a key.
    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        self.run(move |backend| backend.delete(&key)).await
    }

    /// Applies `ops` atomically, in order.
    pub async fn batch(&self, ops: Vec<Operation>) -> Result<()> {
        self.run(move |backend| backend.write_batch(&ops)).await
    }

    /// Closes the handle and releases the backend. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.open_lock.lock().await;
        let was_open = self.is_open();
        if self.status() == DbStatus::Closed {
            return Ok(());
        }
        self.status.send_replace(DbStatus::Closed);

        if was_open {
            let backend = Arc::clone(&self.backend);
            tokio::task::spawn_blocking(move || backend.close()).await??;
        }
        debug!("database closed");
        Ok(())
    }

    /// Creates a write stream bound to this handle.
    ///
    /// The handle does not need to be open yet. Must be called from within
    /// a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `options` fail validation.
    pub fn write_stream(self: &Arc<Self>, options: WriteStreamOptions) -> Result<WriteStream> {
        WriteStream::new(Arc::clone(self), options)
    }
}
