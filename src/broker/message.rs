//! Message definitions for the broker
//!
//! `Message` is the value handed to consumer handlers. It is built once per
//! publish and cloned into every queue the publish routed to; the payload and
//! the routing strings are shared, so a copy is cheap.
//!
//! Notes on fields:
//! - `sequence`: broker-wide, strictly increasing per publish; orders the
//!   messages of a single queue, never used for deduplication
//! - `exchange`: the exchange the message was published to
//! - `routing_key`: the key given at publish time
//! - `payload`: opaque bytes
//! - `timestamp`: milliseconds since UNIX epoch; set by the broker upon publish

use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sequence: u64,
    pub exchange: Arc<str>,
    pub routing_key: Arc<str>,
    pub payload: Bytes,
    pub timestamp: i64,
}

impl Message {
    pub(crate) fn new(
        sequence: u64,
        exchange: Arc<str>,
        routing_key: &str,
        payload: Bytes,
    ) -> Self {
        Self {
            sequence,
            exchange,
            routing_key: Arc::from(routing_key),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
