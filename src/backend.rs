//! Summary: Storage engine contract consumed by the database handle.
//! Copyright (c) YOAB. All rights reserved.

use crate::error::Result;
use crate::operation::Operation;

/// A key-value storage engine.
///
/// Calls are synchronous and may block; the [`Database`](crate::Database)
/// handle runs them on tokio's blocking pool. Implementations must be safe
/// to share across threads.
pub trait Backend: Send + Sync + 'static {
    /// Opens the engine. Called at most once per successful open.
    fn open(&self) -> Result<()>;

    /// Returns the value stored under `key`, or `None` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Inserts or updates a key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes a key. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Applies all operations atomically, in order.
    fn write_batch(&self, ops: &[Operation]) -> Result<()>;

    /// Releases engine resources. Must be idempotent.
    fn close(&self) -> Result<()>;
}
