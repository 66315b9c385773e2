use crate::broker::Broker;
use crate::broker::queue::{QueueId, QueueOptions};
use crate::utils::error::Result;

pub type ConnectionId = String;

/// Represents a client connected to the broker.
///
/// Each connection is uniquely identified by an `id`. Exclusive and
/// auto-delete queues it declares are deleted when the connection is closed
/// or dropped.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for the connection (`conn-<uuid>`).
    id: ConnectionId,

    broker: Broker,

    released: bool,
}

impl Connection {
    pub(crate) fn new(broker: Broker) -> Self {
        Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            broker,
            released: false,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The broker this connection talks to; use it to publish, bind and consume.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Declares a queue owned by this connection.
    pub fn declare_queue(&self, name: Option<&str>, exclusive: bool) -> Result<QueueId> {
        let options = QueueOptions {
            exclusive,
            auto_delete: false,
        };
        self.declare_queue_with(name, options)
    }

    pub fn declare_queue_with(&self, name: Option<&str>, options: QueueOptions) -> Result<QueueId> {
        self.broker.declare_queue_owned(name, options, Some(&self.id))
    }

    /// Closes the connection, deleting its exclusive and auto-delete queues.
    /// Returns how many queues were deleted.
    pub fn close(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        self.broker.release_connection(&self.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}
