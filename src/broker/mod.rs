pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod routing;

pub use engine::Broker;
pub use exchange::{ExchangeKind, ExchangeRef};
pub use message::Message;
pub use queue::{Handler, HandlerError, HandlerResult, QueueId, QueueInfo, QueueOptions};
