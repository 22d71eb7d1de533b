//! Summary: Buffered, flow-controlled write stream over a database handle.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A [`WriteStream`] accepts operations synchronously and applies them to a
//! [`Database`] from a background worker task. Writes issued in the same
//! scheduler turn land in the queue before the worker runs, so they reach the
//! store as a single batch.
//!
//! # Lifecycle
//!
//! ```text
//! Initial --(handle already open)--> Ready
//! Opening --(handle opens)---------> Ready
//! Initial|Opening|Ready --(end / destroy_soon)--> Ending -----(queue drained)---> Closed
//! Initial|Opening|Ready --(destroy)-------------> Destroying --(queue discarded)-> Closed
//! ```
//!
//! A failed open is reported and the stream keeps waiting in `Opening`; a
//! later successful `open` on the handle still makes it ready. A stream that
//! is ended while its handle's last open attempt has failed discards its
//! queue and closes.
//!
//! # Notifications
//!
//! Subscribers receive [`StreamEvent`]s on an unbounded channel:
//! `Ready` at most once and before the first flush, `Drain` once for every
//! time a `false` return from [`WriteStream::write`] has been worked off,
//! `Error` for every failed open or apply, and exactly one `Close`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, trace, warn};

use crate::db::{Database, DbStatus, OpenOutcome};
use crate::error::{Error, Result};
use crate::operation::Operation;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Default byte budget of one store write (16MB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Framing overhead counted per operation against the byte budget.
const OP_OVERHEAD: usize = 9;

/// Configuration for a write stream.
#[derive(Debug, Clone)]
pub struct WriteStreamOptions {
    /// Queue length above which `write` returns `false`. `None` never
    /// signals backpressure.
    pub max_buffer_length: Option<usize>,
    /// Maximum number of operations applied by one store write.
    pub max_batch_size: usize,
    /// Approximate byte budget of one store write. A single operation larger
    /// than the budget is still applied on its own.
    pub max_batch_bytes: usize,
    /// Extra time the worker waits after being woken, letting writes from
    /// other threads join the next batch.
    pub coalesce_window: Duration,
}

impl Default for WriteStreamOptions {
    fn default() -> Self {
        Self {
            max_buffer_length: None,
            max_batch_size: usize::MAX,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            coalesce_window: Duration::ZERO,
        }
    }
}

impl WriteStreamOptions {
    /// Sets the backpressure threshold.
    pub fn max_buffer_length(mut self, len: usize) -> Self {
        self.max_buffer_length = Some(len);
        self
    }

    /// Sets the largest batch handed to the store.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the byte budget of one store write.
    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_bytes = bytes;
        self
    }

    /// Sets the coalescing window.
    pub fn coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_buffer_length == Some(0) {
            return Err(Error::InvalidOptions(
                "max_buffer_length must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidOptions(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::InvalidOptions(
                "max_batch_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a write stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Bound to an open handle, worker not started yet.
    Initial,
    /// Waiting for the handle to open; writes are buffered.
    Opening,
    /// Flushing writes as they arrive.
    Ready,
    /// Draining the queue before closing.
    Ending,
    /// Queue discarded, waiting for an in-flight apply.
    Destroying,
    /// Terminal.
    Closed,
}

impl StreamState {
    /// Returns true if `write` is accepted in this state.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            StreamState::Initial | StreamState::Opening | StreamState::Ready
        )
    }
}

/// A notification emitted by a write stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The store is open; flushing begins.
    Ready,
    /// The queue is back within `max_buffer_length`; writing may resume.
    Drain,
    /// The store rejected an open or an apply.
    Error(Arc<Error>),
    /// The stream is closed. Always the last event.
    Close,
}

/// Counters describing the work a stream has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Multi-operation store writes applied.
    pub batches: u64,
    /// Single put/delete store writes applied.
    pub single_writes: u64,
    /// Operations applied successfully.
    pub ops_applied: u64,
    /// Operations dropped by `destroy` or an open failure.
    pub ops_discarded: u64,
    /// `Drain` notifications emitted.
    pub drains: u64,
    /// `Error` notifications emitted.
    pub errors: u64,
}

impl StreamStats {
    /// Returns the average operations per store write.
    pub fn avg_batch_size(&self) -> f64 {
        let writes = self.batches + self.single_writes;
        if writes == 0 {
            0.0
        } else {
            self.ops_applied as f64 / writes as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    single_writes: AtomicU64,
    ops_applied: AtomicU64,
    ops_discarded: AtomicU64,
    drains: AtomicU64,
    errors: AtomicU64,
}

/// State protected by the stream mutex.
struct Inner {
    state: StreamState,
    queue: VecDeque<Operation>,
    /// Set when `write` returned false; cleared when `Drain` is emitted.
    drain_pending: bool,
    subscribers: Vec<UnboundedSender<StreamEvent>>,
}

struct Shared {
    id: u64,
    inner: Mutex<Inner>,
    /// Wakes the worker on writes and termination requests.
    wake: Notify,
    closed: watch::Sender<bool>,
    db: Arc<Database>,
    options: WriteStreamOptions,
    counters: Counters,
}

/// Ends the stream gracefully once the last user handle is dropped.
struct HandleGuard(Arc<Shared>);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.request_end();
    }
}

/// A buffered, flow-controlled sink of write operations.
///
/// Cloning is cheap; clones share one queue and one worker. Dropping every
/// clone without terminating the stream behaves like [`end`](Self::end).
///
/// The stream is write-only: [`readable`](Self::readable) is always false.
#[derive(Clone)]
pub struct WriteStream {
    shared: Arc<Shared>,
    _guard: Arc<HandleGuard>,
}

/// How waiting for the handle ended.
enum StoreWait {
    Open,
    /// Open failed and the stream was ended.
    Failed,
    Destroyed,
}

/// One pass of the worker loop.
enum Step {
    Flush(Vec<Operation>),
    Wait,
    Finish,
}

impl WriteStream {
    /// Binds a new stream to `db` and spawns its worker.
    pub(crate) fn new(db: Arc<Database>, options: WriteStreamOptions) -> Result<Self> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::TaskFailed(format!("write stream requires a tokio runtime: {e}")))?;

        // Subscribe before reading the status so no attempt is missed.
        let opens = db.open_events();
        let state = if db.is_open() {
            StreamState::Initial
        } else {
            StreamState::Opening
        };
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner {
                state,
                queue: VecDeque::new(),
                drain_pending: false,
                subscribers: Vec::new(),
            }),
            wake: Notify::new(),
            closed,
            db,
            options,
            counters: Counters::default(),
        });

        let span = tracing::debug_span!("write_stream", id = shared.id);
        runtime.spawn(Arc::clone(&shared).run(opens).instrument(span));
        debug!(stream = shared.id, ?state, "write stream created");

        Ok(Self {
            _guard: Arc::new(HandleGuard(Arc::clone(&shared))),
            shared,
        })
    }

    /// Queues an operation.
    ///
    /// Returns `Ok(true)` while the queue is within `max_buffer_length` and
    /// `Ok(false)` once it is exceeded; the operation is queued either way.
    /// After a `false`, a `Drain` event follows once the queue is worked off.
    ///
    /// # Errors
    ///
    /// Returns `NotWritable` once the stream is terminating or closed.
    pub fn write(&self, op: Operation) -> Result<bool> {
        let within = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_writable() {
                return Err(Error::NotWritable);
            }
            inner.queue.push_back(op);
            let within = self.shared.within_threshold(inner.queue.len());
            if !within {
                inner.drain_pending = true;
            }
            within
        };
        self.shared.wake.notify_one();
        Ok(within)
    }

    /// Stops accepting writes, applies everything queued, then closes.
    pub fn end(&self) {
        self.shared.request_end();
    }

    /// Graceful stop; identical to [`end`](Self::end).
    pub fn destroy_soon(&self) {
        self.shared.request_end();
    }

    /// Stops accepting writes and discards every queued operation.
    ///
    /// A store write already in flight is allowed to complete.
    pub fn destroy(&self) {
        let discarded = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_writable() {
                return;
            }
            inner.state = StreamState::Destroying;
            inner.drain_pending = false;
            let discarded = inner.queue.len();
            inner.queue.clear();
            discarded
        };
        self.shared
            .counters
            .ops_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        debug!(stream = self.shared.id, discarded, "write stream destroying");
        self.shared.wake.notify_one();
    }

    /// Subscribes to notifications emitted from now on.
    ///
    /// The channel ends after `Close`. Subscribing to a closed stream
    /// yields a channel that is already finished.
    pub fn subscribe(&self) -> UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.shared.inner.lock();
        if inner.state != StreamState::Closed {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Waits until the stream is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Returns true while `write` is accepted.
    pub fn writable(&self) -> bool {
        self.state().is_writable()
    }

    /// Always false; the stream is a sink.
    pub fn readable(&self) -> bool {
        false
    }

    /// Number of queued operations not yet handed to the store.
    pub fn buffered(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Returns the options this stream was created with.
    pub fn options(&self) -> &WriteStreamOptions {
        &self.shared.options
    }

    /// Returns a snapshot of the stream counters.
    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            batches: c.batches.load(Ordering::Relaxed),
            single_writes: c.single_writes.load(Ordering::Relaxed),
            ops_applied: c.ops_applied.load(Ordering::Relaxed),
            ops_discarded: c.ops_discarded.load(Ordering::Relaxed),
            drains: c.drains.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn within_threshold(&self, len: usize) -> bool {
        self.options.max_buffer_length.is_none_or(|max| len <= max)
    }

    fn request_end(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_writable() {
                return;
            }
            inner.state = StreamState::Ending;
        }
        debug!(stream = self.id, "write stream ending");
        self.wake.notify_one();
    }

    /// Delivers `event` to every live subscriber.
    fn emit(&self, event: StreamEvent) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_error(&self, err: Error) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.emit(StreamEvent::Error(Arc::new(err)));
    }

    /// Worker task: wait for the handle, flush until terminated, close.
    async fn run(self: Arc<Self>, opens: broadcast::Receiver<OpenOutcome>) {
        if let StoreWait::Open = self.wait_for_store(opens).await {
            let destroyed = {
                let mut inner = self.inner.lock();
                if matches!(inner.state, StreamState::Initial | StreamState::Opening) {
                    inner.state = StreamState::Ready;
                }
                inner.state == StreamState::Destroying
            };
            if !destroyed {
                debug!(stream = self.id, "write stream ready");
                self.emit(StreamEvent::Ready);
                // Let subscribers react before the first flush.
                tokio::task::yield_now().await;
                self.flush_loop().await;
            }
        }
        self.finish();
    }

    /// Waits for the handle to open, reporting every failed attempt.
    ///
    /// A failed open leaves the stream waiting for a retry. Once the stream
    /// is ended and the last attempt failed, it gives up.
    async fn wait_for_store(&self, mut opens: broadcast::Receiver<OpenOutcome>) -> StoreWait {
        loop {
            // Attempts already finished are handled in order first.
            loop {
                match opens.try_recv() {
                    Ok(Ok(())) => return StoreWait::Open,
                    Ok(Err(reason)) => self.open_failed(reason),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(stream = self.id, skipped, "missed open attempts");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }

            let state = self.state();
            if state == StreamState::Destroying {
                return StoreWait::Destroyed;
            }
            match self.db.status() {
                DbStatus::Open => return StoreWait::Open,
                DbStatus::OpenFailed(_) | DbStatus::Closed if state == StreamState::Ending => {
                    return StoreWait::Failed;
                }
                _ => {}
            }

            tokio::select! {
                outcome = opens.recv() => match outcome {
                    Ok(Ok(())) => return StoreWait::Open,
                    Ok(Err(reason)) => self.open_failed(reason),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(stream = self.id, skipped, "missed open attempts");
                    }
                    Err(RecvError::Closed) => return StoreWait::Failed,
                },
                _ = self.wake.notified() => {}
            }
        }
    }

    fn open_failed(&self, reason: String) {
        warn!(stream = self.id, %reason, "store failed to open");
        self.emit_error(Error::OpenFailed { reason });
    }

    fn next_step(&self) -> Step {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            StreamState::Destroying => Step::Finish,
            _ if !inner.queue.is_empty() => {
                let take = self.batch_len(&inner.queue);
                Step::Flush(inner.queue.drain(..take).collect())
            }
            StreamState::Ending => Step::Finish,
            _ => Step::Wait,
        }
    }

    /// Number of queued operations that fit in the next batch; at least one.
    fn batch_len(&self, queue: &VecDeque<Operation>) -> usize {
        let mut bytes = 0usize;
        let mut take = 0;
        for op in queue.iter().take(self.options.max_batch_size) {
            bytes = bytes.saturating_add(op.size_hint() + OP_OVERHEAD);
            if take > 0 && bytes > self.options.max_batch_bytes {
                break;
            }
            take += 1;
        }
        take
    }

    async fn flush_loop(&self) {
        loop {
            match self.next_step() {
                Step::Finish => return,
                Step::Wait => {
                    self.wake.notified().await;
                    if !self.options.coalesce_window.is_zero() {
                        tokio::time::sleep(self.options.coalesce_window).await;
                    }
                }
                Step::Flush(ops) => {
                    self.apply(ops).await;
                    if self.take_drain() {
                        self.counters.drains.fetch_add(1, Ordering::Relaxed);
                        self.emit(StreamEvent::Drain);
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }

    /// Hands `ops` to the store: a single put/delete for one operation, one
    /// batch otherwise.
    async fn apply(&self, mut ops: Vec<Operation>) {
        let count = ops.len();
        trace!(stream = self.id, ops = count, "flushing");

        let result = if count == 1 {
            match ops.pop() {
                Some(Operation::Put { key, value }) => self.db.put(key, value).await,
                Some(Operation::Delete { key }) => self.db.delete(key).await,
                None => Ok(()),
            }
        } else {
            self.db.batch(ops).await
        };

        match result {
            Ok(()) => {
                let writes = if count == 1 {
                    &self.counters.single_writes
                } else {
                    &self.counters.batches
                };
                writes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .ops_applied
                    .fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(stream = self.id, ops = count, error = %e, "apply failed");
                self.emit_error(Error::apply(count, e));
            }
        }
    }

    /// Clears the drain latch if the queue is back within the threshold
    /// and the stream still accepts writes.
    fn take_drain(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.drain_pending
            && inner.state.is_writable()
            && self.within_threshold(inner.queue.len())
        {
            inner.drain_pending = false;
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        let subscribers = {
            let mut inner = self.inner.lock();
            let discarded = inner.queue.len();
            inner.queue.clear();
            inner.state = StreamState::Closed;
            self.counters
                .ops_discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            std::mem::take(&mut inner.subscribers)
        };

        debug!(stream = self.id, "write stream closed");
        for tx in subscribers {
            let _ = tx.send(StreamEvent::Close);
        }
        self.closed.send_replace(true);
    }
}
