//! Summary: Buffered, flow-controlled write streams over an embedded key-value store.
//! Copyright (c) YOAB. All rights reserved.
//!
//! thunderstream sits between an unbounded producer of write operations and
//! a store whose write latency varies. A [`WriteStream`] buffers operations
//! until its [`Database`] handle is open, coalesces same-turn writes into
//! batches, signals backpressure through the return value of
//! [`WriteStream::write`] and `Drain` notifications, and terminates in one of
//! three ways: [`end`](WriteStream::end), [`destroy_soon`](WriteStream::destroy_soon)
//! or [`destroy`](WriteStream::destroy).
//!
//! ```no_run
//! use thunderstream::{Database, Operation, StreamEvent, WriteStreamOptions};
//!
//! # async fn demo() -> thunderstream::Result<()> {
//! let db = Database::memory();
//! let ws = db.write_stream(WriteStreamOptions::default().max_buffer_length(64))?;
//! let mut events = ws.subscribe();
//!
//! ws.write(Operation::put("k1", "v1"))?;
//! ws.write(Operation::put("k2", "v2"))?;
//! db.open().await?;
//!
//! ws.end();
//! while let Some(event) = events.recv().await {
//!     if let StreamEvent::Error(err) = event {
//!         eprintln!("write failed: {err}");
//!     }
//! }
//! assert_eq!(db.get("k2").await?, b"v2".to_vec());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod db;
pub mod error;
pub mod log_store;
pub mod memory;
pub mod operation;
pub mod record;
pub mod stream;

pub use backend::Backend;
pub use db::{Database, DbStatus, OpenOutcome};
pub use error::{Error, Result};
pub use log_store::{DatabaseOptions, LogBackend};
pub use memory::MemoryBackend;
pub use operation::Operation;
pub use stream::{StreamEvent, StreamState, StreamStats, WriteStream, WriteStreamOptions};
