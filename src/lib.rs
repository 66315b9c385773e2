//! # topicbus
//!
//! `topicbus` is a minimalist, in-memory message-routing broker built with
//! Rust and tokio. Producers publish to named exchanges; consumers declare
//! queues, bind them to exchanges with fanout or topic routing, and receive
//! messages pushed to a registered handler.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The registry of exchanges and queues, routing and consumer dispatch.
//! - `client`: Client connections that own exclusive queues.
//! - `config`: Handles loading and managing broker configuration.
//! - `utils`: Shared utilities: the error type and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use topicbus::broker::{Broker, ExchangeKind};
//!
//! # async fn run() -> Result<(), topicbus::BrokerError> {
//! let broker = Broker::default();
//! broker.declare_exchange("sensors", ExchangeKind::Topic)?;
//! let queue = broker.declare_queue(None, true)?;
//! broker.bind("sensors", &queue, "accel.*")?;
//! broker.consume(&queue, |msg: topicbus::broker::Message| {
//!     println!("{}: {}", msg.routing_key, msg.payload_lossy());
//!     Ok(())
//! })?;
//! broker.publish("sensors", "accel.xyz", "1.0,0.2,9.8").await?;
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod utils;

pub use broker::Broker;
pub use utils::error::BrokerError;

#[cfg(test)]
mod tests;
