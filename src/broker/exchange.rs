//! Exchange management
//!
//! An `Exchange` is a named routing entity of a fixed kind. It holds the set of
//! bindings to queues and decides, per publish, which queues receive a copy.
//!
//! Concurrency note: exchanges live inside the broker registry and are only
//! mutated under its write lock; `route` runs under the read lock.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::broker::queue::QueueId;
use crate::broker::routing::{self, TopicPattern};
use crate::utils::error::{BrokerError, Result};

/// Routing strategy of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue receives every message.
    Fanout,
    /// Queues receive messages whose routing key matches their binding pattern.
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(BrokerError::Validation(format!(
                "unknown exchange kind '{other}'"
            ))),
        }
    }
}

/// Handle returned by `declare_exchange`.
///
/// Two references compare equal only when they point at the same declaration,
/// so redeclaring an existing exchange yields an equal reference while a
/// deleted and recreated exchange does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeRef {
    id: u64,
    name: Arc<str>,
    kind: ExchangeKind,
}

impl ExchangeRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }
}

/// A single exchange → queue association.
///
/// For fanout exchanges the pattern is stored empty and never consulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: QueueId,
    pub pattern: String,
    matcher: Option<TopicPattern>,
}

#[derive(Debug)]
pub struct Exchange {
    reference: ExchangeRef,
    bindings: HashSet<Binding>,
}

impl Exchange {
    pub(crate) fn new(id: u64, name: &str, kind: ExchangeKind) -> Self {
        Self {
            reference: ExchangeRef {
                id,
                name: Arc::from(name),
                kind,
            },
            bindings: HashSet::new(),
        }
    }

    pub fn reference(&self) -> &ExchangeRef {
        &self.reference
    }

    pub fn name(&self) -> &Arc<str> {
        &self.reference.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.reference.kind
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    /// Builds the binding `queue`/`pattern` would produce on this exchange,
    /// validating the pattern for topic exchanges.
    pub(crate) fn make_binding(&self, queue: &QueueId, pattern: &str) -> Result<Binding> {
        let (pattern, matcher) = match self.kind() {
            ExchangeKind::Fanout => (String::new(), None),
            ExchangeKind::Topic => (pattern.to_string(), Some(TopicPattern::parse(pattern)?)),
        };
        Ok(Binding {
            queue: queue.clone(),
            pattern,
            matcher,
        })
    }

    /// Adds a binding. Returns `false` when the identical binding already exists.
    pub(crate) fn bind(&mut self, binding: Binding) -> bool {
        self.bindings.insert(binding)
    }

    /// Removes a binding. Returns `false` when it was not present.
    pub(crate) fn unbind(&mut self, binding: &Binding) -> bool {
        self.bindings.remove(binding)
    }

    /// Removes every binding to `queue`; returns how many were removed.
    pub(crate) fn unbind_queue(&mut self, queue: &QueueId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| &b.queue != queue);
        before - self.bindings.len()
    }

    /// Returns the distinct queues a message with `routing_key` is routed to.
    ///
    /// Topic exchanges reject keys with empty segments.
    pub fn route(&self, routing_key: &str) -> Result<HashSet<QueueId>> {
        match self.kind() {
            ExchangeKind::Fanout => Ok(self.bindings.iter().map(|b| b.queue.clone()).collect()),
            ExchangeKind::Topic => {
                routing::validate_key(routing_key)?;
                Ok(self
                    .bindings
                    .iter()
                    .filter(|b| b.matcher.as_ref().is_some_and(|m| m.matches(routing_key)))
                    .map(|b| b.queue.clone())
                    .collect())
            }
        }
    }
}
