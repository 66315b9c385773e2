//! The `client` module defines the representation of a client connection to
//! the broker.
//!
//! It provides the `Connection` struct. Queues declared through a connection
//! are owned by it, and its exclusive and auto-delete queues are deleted when
//! it ends, the lifetime an AMQP client gives to such queues.

pub mod connection;
pub use connection::{Connection, ConnectionId};

#[cfg(test)]
mod tests;
