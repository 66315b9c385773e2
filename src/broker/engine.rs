//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - declaring and deleting exchanges and queues
//! - binding queues to exchanges and routing published messages
//! - attaching consumers to queues
//! - deleting a connection's exclusive and auto-delete queues when it ends
//!
//! Concurrency and usage notes:
//! - `Broker` is a cheap, cloneable handle. All clones share one registry.
//! - Registry mutations (declare, delete, bind, unbind, consume, cancel)
//!   serialize on a write lock. `publish` only holds the read lock while it
//!   resolves the target queues and releases it before appending, so a full
//!   queue never blocks registry operations.
//! - Sequence numbers are taken under the same short lock that offers the
//!   message to its queues, so every queue sees sequences in increasing order.
//! - Queues spawn their dispatch task on the ambient tokio runtime, or on the
//!   runtime the broker was created in when declared from a plain thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::exchange::{Exchange, ExchangeKind, ExchangeRef};
use crate::broker::message::Message;
use crate::broker::queue::{
    Handler, HandlerResult, Offer, Queue, QueueId, QueueInfo, QueueOptions,
};
use crate::client::{Connection, ConnectionId};
use crate::config::BrokerSettings;
use crate::utils::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    registry: RwLock<Registry>,
    settings: BrokerSettings,
    next_sequence: Mutex<u64>,
    runtime: Option<Handle>,
}

#[derive(Debug, Default)]
struct Registry {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<QueueId, Arc<Queue>>,
    next_exchange_id: u64,
    closed: bool,
}

impl Registry {
    /// Removes a queue and every binding that references it, then stops its
    /// dispatch loop. Returns the number of discarded messages.
    fn remove_queue(&mut self, id: &QueueId) -> Option<usize> {
        let queue = self.queues.remove(id)?;
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(id);
        }
        Some(queue.close())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// Creates a broker. A `queue_capacity` of zero is raised to one.
    ///
    /// When called inside a tokio runtime, that runtime also hosts queues
    /// declared later from outside any runtime.
    pub fn new(mut settings: BrokerSettings) -> Self {
        settings.queue_capacity = settings.queue_capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::default()),
                settings,
                next_sequence: Mutex::new(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.shared.settings
    }

    /// Opens a client connection. Exclusive and auto-delete queues declared
    /// through it are deleted when it is closed or dropped.
    pub fn connect(&self) -> Connection {
        Connection::new(self.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        let registry = self
            .shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.closed {
            return Err(BrokerError::Closed);
        }
        Ok(registry)
    }

    fn runtime(&self) -> Result<Handle> {
        Handle::try_current()
            .ok()
            .or_else(|| self.shared.runtime.clone())
            .ok_or(BrokerError::NoRuntime)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        let registry = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.closed {
            return Err(BrokerError::Closed);
        }
        Ok(registry)
    }

    /// Declares an exchange, or returns the existing one if `name` is already
    /// declared with the same kind.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeRef> {
        if name.is_empty() {
            return Err(BrokerError::Validation(
                "exchange name must not be empty".to_string(),
            ));
        }

        let mut registry = self.write()?;

        if let Some(existing) = registry.exchanges.get(name) {
            if existing.kind() != kind {
                return Err(BrokerError::Conflict(format!(
                    "exchange '{name}' already declared as {}, not {kind}",
                    existing.kind()
                )));
            }
            return Ok(existing.reference().clone());
        }

        registry.next_exchange_id += 1;
        let exchange = Exchange::new(registry.next_exchange_id, name, kind);
        let reference = exchange.reference().clone();
        registry.exchanges.insert(name.to_string(), exchange);

        info!(exchange = name, %kind, "exchange declared");
        Ok(reference)
    }

    /// Deletes an exchange and all of its bindings. Deleting an unknown
    /// exchange is a no-op. Messages already buffered in formerly bound
    /// queues are kept.
    pub fn delete_exchange(&self, name: &str) -> Result<()> {
        let mut registry = self.write()?;
        if let Some(exchange) = registry.exchanges.remove(name) {
            info!(
                exchange = name,
                bindings = exchange.bindings().count(),
                "exchange deleted"
            );
        }
        Ok(())
    }

    /// Declares a queue. Without a name a unique `gen-…` id is generated.
    pub fn declare_queue(&self, name: Option<&str>, exclusive: bool) -> Result<QueueId> {
        let options = QueueOptions {
            exclusive,
            auto_delete: false,
        };
        self.declare_queue_owned(name, options, None)
    }

    pub fn declare_queue_with(&self, name: Option<&str>, options: QueueOptions) -> Result<QueueId> {
        self.declare_queue_owned(name, options, None)
    }

    pub(crate) fn declare_queue_owned(
        &self,
        name: Option<&str>,
        options: QueueOptions,
        owner: Option<&ConnectionId>,
    ) -> Result<QueueId> {
        let mut registry = self.write()?;

        let id = match name {
            Some("") => {
                return Err(BrokerError::Validation(
                    "queue name must not be empty; pass None to generate one".to_string(),
                ));
            }
            Some(name) => {
                let id = QueueId::from(name);
                if let Some(existing) = registry.queues.get(&id) {
                    check_redeclare(existing, options, owner)?;
                    return Ok(id);
                }
                id
            }
            None => QueueId::generate(),
        };

        let queue = Queue::spawn(
            &self.runtime()?,
            id.clone(),
            options,
            owner.cloned(),
            self.shared.settings.queue_capacity,
        );
        registry.queues.insert(id.clone(), queue);

        info!(
            queue = %id,
            exclusive = options.exclusive,
            auto_delete = options.auto_delete,
            "queue declared"
        );
        Ok(id)
    }

    /// Deletes a queue, its bindings and its buffered messages. Returns the
    /// number of messages discarded.
    pub fn delete_queue(&self, queue: &QueueId) -> Result<usize> {
        let mut registry = self.write()?;
        let discarded = registry
            .remove_queue(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue.as_str()))?;

        info!(queue = %queue, discarded, "queue deleted");
        Ok(discarded)
    }

    /// Binds `queue` to `exchange`. The pattern is ignored by fanout
    /// exchanges. Binding twice is a no-op.
    pub fn bind(&self, exchange: &str, queue: &QueueId, pattern: &str) -> Result<()> {
        let mut registry = self.write()?;

        if !registry.queues.contains_key(queue) {
            return Err(BrokerError::queue_not_found(queue.as_str()));
        }
        let target = registry
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;

        let binding = target.make_binding(queue, pattern)?;
        if target.bind(binding) {
            debug!(exchange, queue = %queue, pattern, "queue bound");
        } else {
            debug!(exchange, queue = %queue, pattern, "binding already exists");
        }
        Ok(())
    }

    /// Removes one binding.
    pub fn unbind(&self, exchange: &str, queue: &QueueId, pattern: &str) -> Result<()> {
        let mut registry = self.write()?;

        if !registry.queues.contains_key(queue) {
            return Err(BrokerError::queue_not_found(queue.as_str()));
        }
        let target = registry
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;

        let binding = target.make_binding(queue, pattern)?;
        if !target.unbind(&binding) {
            return Err(BrokerError::binding_not_found(format!(
                "{exchange} -> {queue} ({pattern})"
            )));
        }

        debug!(exchange, queue = %queue, pattern, "queue unbound");
        Ok(())
    }

    /// Publishes `payload` to `exchange` and returns how many queues received
    /// a copy. Zero is not an error: unroutable messages are dropped.
    ///
    /// Queues with room receive their copy at once. Full queues are waited on
    /// together for up to the configured publish timeout, after which the
    /// publish fails with [`BrokerError::Capacity`]. Copies appended to other
    /// queues stay there.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        let (exchange_name, targets) = {
            let registry = self.read()?;
            let source = registry
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;

            let targets: Vec<Arc<Queue>> = source
                .route(routing_key)?
                .iter()
                .filter_map(|id| registry.queues.get(id).cloned())
                .collect();
            (Arc::clone(source.name()), targets)
        };

        let payload = payload.into();
        let timeout = self.shared.settings.publish_timeout();
        let wait = !timeout.is_zero();

        let (sequence, offers) = {
            let mut next = self
                .shared
                .next_sequence
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let sequence = *next;
            *next += 1;

            let message = Message::new(sequence, exchange_name, routing_key, payload);
            let offers: Vec<(Arc<Queue>, Offer)> = targets
                .into_iter()
                .map(|queue| {
                    let offer = queue.offer(message.clone(), wait);
                    (queue, offer)
                })
                .collect();
            (sequence, offers)
        };

        // every waiting copy is already in line, so one shared deadline
        let deadline = Instant::now() + timeout;
        let mut delivered = 0;
        let mut rejected = None;
        for (queue, offer) in offers {
            let appended = match offer {
                Offer::Appended => Ok(true),
                Offer::Deleted => Ok(false),
                Offer::Full => Err(queue.full()),
                Offer::Waiting(appended) => queue.settle(sequence, appended, deadline).await,
            };
            match appended {
                Ok(true) => delivered += 1,
                Ok(false) => {
                    debug!(queue = %queue.id(), sequence, "queue deleted while publishing")
                }
                Err(e) => {
                    warn!(queue = %queue.id(), sequence, "queue full, copy dropped");
                    if rejected.is_none() {
                        rejected = Some(e);
                    }
                }
            }
        }

        if let Some(e) = rejected {
            return Err(e);
        }
        if delivered == 0 {
            debug!(exchange, routing_key, sequence, "message unroutable, dropped");
        } else {
            debug!(exchange, routing_key, sequence, delivered, "message routed");
        }
        Ok(delivered)
    }

    /// Attaches `handler` as the consumer of `queue`.
    ///
    /// An exclusive queue accepts one consumer at a time; on other queues the
    /// new handler replaces the previous one.
    pub fn consume<F>(&self, queue: &QueueId, handler: F) -> Result<()>
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.consume_handler(queue, Arc::new(handler))
    }

    /// Like [`consume`](Self::consume), for handlers implementing [`Handler`].
    pub fn consume_handler(&self, queue: &QueueId, handler: Arc<dyn Handler>) -> Result<()> {
        let registry = self.write()?;
        let target = registry
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue.as_str()))?;

        if target.has_consumer() {
            if target.options().exclusive {
                return Err(BrokerError::Conflict(format!(
                    "exclusive queue '{queue}' already has a consumer"
                )));
            }
            warn!(queue = %queue, "replacing existing consumer");
        }

        target.attach(handler);
        info!(queue = %queue, "consumer attached");
        Ok(())
    }

    /// Detaches the consumer of `queue`. Buffered messages stay queued. An
    /// auto-delete queue is deleted once its consumer is cancelled.
    pub fn cancel(&self, queue: &QueueId) -> Result<()> {
        let mut registry = self.write()?;
        let target = registry
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue.as_str()))?;

        if !target.detach() {
            return Ok(());
        }
        info!(queue = %queue, "consumer cancelled");

        if target.options().auto_delete {
            if let Some(discarded) = registry.remove_queue(queue) {
                info!(queue = %queue, discarded, "auto-delete queue deleted");
            }
        }
        Ok(())
    }

    pub fn queue_info(&self, queue: &QueueId) -> Result<QueueInfo> {
        let registry = self.read()?;
        registry
            .queues
            .get(queue)
            .map(|q| q.info())
            .ok_or_else(|| BrokerError::queue_not_found(queue.as_str()))
    }

    /// Declared exchanges, sorted by name.
    pub fn exchanges(&self) -> Result<Vec<ExchangeRef>> {
        let registry = self.read()?;
        let mut refs: Vec<ExchangeRef> = registry
            .exchanges
            .values()
            .map(|e| e.reference().clone())
            .collect();
        refs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(refs)
    }

    /// Declared queues, sorted by id.
    pub fn queues(&self) -> Result<Vec<QueueId>> {
        let registry = self.read()?;
        let mut ids: Vec<QueueId> = registry.queues.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Bindings of `exchange` as `(queue, pattern)` pairs, sorted.
    pub fn bindings(&self, exchange: &str) -> Result<Vec<(QueueId, String)>> {
        let registry = self.read()?;
        let source = registry
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;

        let mut bindings: Vec<(QueueId, String)> = source
            .bindings()
            .map(|b| (b.queue.clone(), b.pattern.clone()))
            .collect();
        bindings.sort();
        Ok(bindings)
    }

    /// Deletes the exclusive and auto-delete queues owned by a connection.
    pub(crate) fn release_connection(&self, connection: &ConnectionId) -> usize {
        let Ok(mut registry) = self.write() else {
            return 0;
        };

        let owned: Vec<QueueId> = registry
            .queues
            .values()
            .filter(|q| {
                let options = q.options();
                (options.exclusive || options.auto_delete) && q.owner() == Some(connection)
            })
            .map(|q| q.id().clone())
            .collect();

        for id in &owned {
            if let Some(discarded) = registry.remove_queue(id) {
                debug!(queue = %id, discarded, "queue deleted with its connection");
            }
        }

        info!(connection = %connection, queues = owned.len(), "connection closed");
        owned.len()
    }

    /// Shuts the broker down, discarding every buffered message, and waits for
    /// the dispatch loops to stop. Returns the number of discarded messages.
    ///
    /// Afterwards every operation fails with [`BrokerError::Closed`].
    pub async fn shutdown(&self) -> usize {
        let (discarded, tasks) = {
            let Ok(mut registry) = self.write() else {
                return 0;
            };
            registry.closed = true;
            registry.exchanges.clear();

            let mut discarded = 0;
            let mut tasks = Vec::with_capacity(registry.queues.len());
            for (_, queue) in registry.queues.drain() {
                discarded += queue.close();
                tasks.extend(queue.take_task());
            }
            (discarded, tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }

        info!(discarded, "broker shut down");
        discarded
    }
}

fn check_redeclare(
    existing: &Queue,
    options: QueueOptions,
    owner: Option<&ConnectionId>,
) -> Result<()> {
    let current = existing.options();
    if current != options {
        return Err(BrokerError::Conflict(format!(
            "queue '{}' already declared with exclusive={} auto_delete={}",
            existing.id(),
            current.exclusive,
            current.auto_delete
        )));
    }
    if current.exclusive && existing.owner() != owner {
        return Err(BrokerError::Conflict(format!(
            "exclusive queue '{}' is owned by another connection",
            existing.id()
        )));
    }
    Ok(())
}
