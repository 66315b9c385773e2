//! Queues and their dispatch loops
//!
//! Each queue owns a bounded FIFO buffer and a consumer slot (a watch
//! channel). A dedicated task per queue waits until both a consumer is
//! attached and a message is buffered, then hands messages to the consumer one
//! at a time, in append order.
//!
//! A message offered to a full queue joins the queue's wait list instead of
//! the buffer. Waiters are promoted into the buffer in offer order as the
//! dispatch loop frees slots, so a message never overtakes one offered before
//! it, however long the wait.
//!
//! Delivery is at-most-once: a dequeued message is never put back, even when
//! the handler fails or panics. Failures are logged and counted.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::broker::message::Message;
use crate::client::ConnectionId;
use crate::utils::error::{BrokerError, Result};

/// Unique identifier of a queue within a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(Arc<str>);

impl QueueId {
    /// Generates a fresh id for an anonymous queue.
    pub(crate) fn generate() -> Self {
        QueueId(Arc::from(format!("gen-{}", uuid::Uuid::new_v4().simple())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueId {
    fn from(s: &str) -> Self {
        QueueId(Arc::from(s))
    }
}

impl From<String> for QueueId {
    fn from(s: String) -> Self {
        QueueId(Arc::from(s))
    }
}

impl AsRef<str> for QueueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for QueueId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Declaration options of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// At most one consumer at a time; deleted when the owning connection ends.
    pub exclusive: bool,
    /// Deleted when its consumer is cancelled or its owning connection ends.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            auto_delete: false,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Sink for the messages of one queue.
///
/// Handlers run on tokio's blocking pool, one message at a time per queue.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, message: Message) -> HandlerResult {
        self(message)
    }
}

#[derive(Clone)]
enum Slot {
    Idle,
    Consuming(Arc<dyn Handler>),
    Deleted,
}

#[derive(Debug, Default)]
struct QueueStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub id: QueueId,
    pub options: QueueOptions,
    /// Messages buffered and not yet dequeued.
    pub depth: usize,
    pub capacity: usize,
    pub has_consumer: bool,
    /// Messages handed to a handler.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
}

/// Result of offering a message to a queue.
pub(crate) enum Offer {
    Appended,
    /// The buffer is full; the message is appended once room frees up unless
    /// it is withdrawn first.
    Waiting(oneshot::Receiver<()>),
    /// The buffer is full and the caller would not wait.
    Full,
    Deleted,
}

struct Waiter {
    message: Message,
    appended: oneshot::Sender<()>,
}

#[derive(Default)]
struct BufferState {
    items: VecDeque<Message>,
    // non-empty only while `items` is at capacity
    waiting: VecDeque<Waiter>,
    closed: bool,
}

struct Buffer {
    capacity: usize,
    state: Mutex<BufferState>,
    available: Notify,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BufferState::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer(&self, message: Message, wait: bool) -> Offer {
        let mut state = self.lock();
        if state.closed {
            return Offer::Deleted;
        }

        if state.items.len() < self.capacity && state.waiting.is_empty() {
            state.items.push_back(message);
            drop(state);
            self.available.notify_one();
            return Offer::Appended;
        }

        if !wait {
            return Offer::Full;
        }
        let (appended, rx) = oneshot::channel();
        state.waiting.push_back(Waiter { message, appended });
        Offer::Waiting(rx)
    }

    /// Dequeues the oldest message and promotes the first waiter into the
    /// freed slot.
    fn pop(&self) -> Option<Message> {
        let mut state = self.lock();
        let message = state.items.pop_front()?;
        if let Some(waiter) = state.waiting.pop_front() {
            state.items.push_back(waiter.message);
            let _ = waiter.appended.send(());
        }
        Some(message)
    }

    /// Drops a waiting message. Returns `false` when it is no longer waiting,
    /// either because it was appended or because the queue was closed.
    fn withdraw(&self, sequence: u64) -> bool {
        let mut state = self.lock();
        match state
            .waiting
            .iter()
            .position(|w| w.message.sequence == sequence)
        {
            Some(idx) => {
                state.waiting.remove(idx);
                true
            }
            None => false,
        }
    }

    fn depth(&self) -> usize {
        self.lock().items.len()
    }

    fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.waiting.clear();
        let discarded = state.items.len();
        state.items.clear();
        discarded
    }
}

pub(crate) struct Queue {
    id: QueueId,
    options: QueueOptions,
    owner: Option<ConnectionId>,
    buffer: Arc<Buffer>,
    slot: watch::Sender<Slot>,
    stats: Arc<QueueStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("owner", &self.owner)
            .field("capacity", &self.buffer.capacity)
            .finish()
    }
}

impl Queue {
    /// Creates the queue and spawns its dispatch loop on `runtime`.
    pub(crate) fn spawn(
        runtime: &Handle,
        id: QueueId,
        options: QueueOptions,
        owner: Option<ConnectionId>,
        capacity: usize,
    ) -> Arc<Self> {
        let buffer = Arc::new(Buffer::new(capacity));
        let (slot, slot_rx) = watch::channel(Slot::Idle);
        let stats = Arc::new(QueueStats::default());

        let task = runtime.spawn(dispatch_loop(
            id.clone(),
            buffer.clone(),
            slot_rx,
            stats.clone(),
        ));

        Arc::new(Self {
            id,
            options,
            owner,
            buffer,
            slot,
            stats,
            task: Mutex::new(Some(task)),
        })
    }

    pub(crate) fn id(&self) -> &QueueId {
        &self.id
    }

    pub(crate) fn options(&self) -> QueueOptions {
        self.options
    }

    pub(crate) fn owner(&self) -> Option<&ConnectionId> {
        self.owner.as_ref()
    }

    pub(crate) fn depth(&self) -> usize {
        self.buffer.depth()
    }

    pub(crate) fn has_consumer(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Consuming(_))
    }

    /// Installs `handler` as the queue's consumer, replacing any previous one.
    pub(crate) fn attach(&self, handler: Arc<dyn Handler>) {
        self.slot.send_replace(Slot::Consuming(handler));
    }

    /// Detaches the consumer. Returns `false` if none was attached.
    pub(crate) fn detach(&self) -> bool {
        let mut detached = false;
        self.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Consuming(_)) {
                *slot = Slot::Idle;
                detached = true;
            }
            detached
        });
        detached
    }

    /// Marks the queue deleted, which stops its dispatch loop and releases
    /// waiting publishers. Returns the number of discarded buffered messages.
    pub(crate) fn close(&self) -> usize {
        let discarded = self.buffer.close();
        self.slot.send_replace(Slot::Deleted);
        discarded
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Appends `message` if the buffer has room. Otherwise, with `wait` set,
    /// the message is queued behind earlier waiters; see [`Queue::settle`].
    ///
    /// Never blocks.
    pub(crate) fn offer(&self, message: Message, wait: bool) -> Offer {
        self.buffer.offer(message, wait)
    }

    /// Waits until the message `sequence` left waiting by [`Queue::offer`] is
    /// appended. Past `deadline` it is withdrawn and the queue reported full.
    ///
    /// Returns `Ok(false)` when the queue was deleted in the meantime.
    pub(crate) async fn settle(
        &self,
        sequence: u64,
        mut appended: oneshot::Receiver<()>,
        deadline: Instant,
    ) -> Result<bool> {
        match tokio::time::timeout_at(deadline, &mut appended).await {
            Ok(result) => Ok(result.is_ok()),
            Err(_) if self.buffer.withdraw(sequence) => Err(self.full()),
            // promoted or closed right at the deadline
            Err(_) => Ok(appended.try_recv().is_ok()),
        }
    }

    pub(crate) fn full(&self) -> BrokerError {
        BrokerError::Capacity {
            queue: self.id.to_string(),
            capacity: self.buffer.capacity,
        }
    }

    pub(crate) fn info(&self) -> QueueInfo {
        QueueInfo {
            id: self.id.clone(),
            options: self.options,
            depth: self.depth(),
            capacity: self.buffer.capacity,
            has_consumer: self.has_consumer(),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch_loop(
    id: QueueId,
    buffer: Arc<Buffer>,
    mut slot: watch::Receiver<Slot>,
    stats: Arc<QueueStats>,
) {
    debug!(queue = %id, "dispatch loop started");

    loop {
        let handler = match &*slot.borrow_and_update() {
            Slot::Consuming(handler) => Some(Arc::clone(handler)),
            Slot::Idle => None,
            Slot::Deleted => break,
        };

        let Some(handler) = handler else {
            if slot.changed().await.is_err() {
                break;
            }
            continue;
        };

        if let Some(message) = buffer.pop() {
            deliver(&id, handler, message, &stats).await;
            continue;
        }

        tokio::select! {
            // consumer changes win over new messages
            biased;
            changed = slot.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = buffer.available.notified() => {}
        }
    }

    debug!(queue = %id, "dispatch loop stopped");
}

async fn deliver(queue: &QueueId, handler: Arc<dyn Handler>, message: Message, stats: &QueueStats) {
    let sequence = message.sequence;
    stats.delivered.fetch_add(1, Ordering::Relaxed);

    match tokio::task::spawn_blocking(move || handler.handle(message)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(queue = %queue, sequence, error = %e, "consumer handler failed");
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(queue = %queue, sequence, error = %e, "consumer handler panicked");
        }
    }
}
