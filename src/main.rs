//! CLI for topicbus
//!
//! Runs the classic producer/consumer setups against an in-process broker:
//! - `fanout`: one producer, several customers each on an exclusive queue
//! - `topic`: one subscriber bound by pattern, one publisher sending a key

use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use topicbus::broker::{Broker, ExchangeKind, HandlerResult, Message};
use topicbus::client::Connection;
use topicbus::config::load_config;
use topicbus::utils::logging;

#[derive(Parser)]
#[command(name = "topicbus")]
enum Command {
    /// Fan one producer's messages out to every customer
    Fanout {
        #[arg(long, default_value = "pubsub")]
        exchange: String,
        /// Number of customers, each with its own exclusive queue
        #[arg(long, default_value_t = 2)]
        customers: usize,
        /// Messages to publish; 0 publishes until Ctrl-C
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Route by routing key through a topic exchange
    Topic {
        #[arg(long, default_value = "amq.topic")]
        exchange: String,
        /// Binding pattern of the subscriber
        #[arg(long, default_value = "test.*")]
        pattern: String,
        /// Routing key the publisher sends with
        #[arg(long, default_value = "test.topic")]
        key: String,
        /// Messages to publish; 0 publishes until Ctrl-C
        #[arg(long, default_value_t = 3)]
        count: u64,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();
    let _ = dotenvy::dotenv();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let broker = Broker::new(config.broker);

    let result = match cmd {
        Command::Fanout {
            exchange,
            customers,
            count,
            interval_ms,
        } => run_fanout(&broker, &exchange, customers, count, interval_ms).await,
        Command::Topic {
            exchange,
            pattern,
            key,
            count,
            interval_ms,
        } => run_topic(&broker, &exchange, &pattern, &key, count, interval_ms).await,
    };

    if let Err(e) = result {
        error!("Run failed: {}", e);
    }

    let discarded = broker.shutdown().await;
    info!(discarded, "Shut down");
}

/// Handler printing every delivery as one JSON line.
fn printer(label: String) -> impl Fn(Message) -> HandlerResult + Send + Sync + 'static {
    move |msg: Message| -> HandlerResult {
        let line = json!({
            "consumer": label,
            "exchange": &*msg.exchange,
            "routing_key": &*msg.routing_key,
            "sequence": msg.sequence,
            "timestamp": msg.timestamp,
            "payload": msg.payload_lossy(),
        });
        println!("{line}");
        Ok(())
    }
}

async fn run_fanout(
    broker: &Broker,
    exchange: &str,
    customers: usize,
    count: u64,
    interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut connections: Vec<Connection> = Vec::with_capacity(customers);
    for n in 1..=customers {
        let conn = broker.connect();
        conn.broker().declare_exchange(exchange, ExchangeKind::Fanout)?;
        let queue = conn.declare_queue(None, true)?;
        conn.broker().bind(exchange, &queue, "")?;
        conn.broker().consume(&queue, printer(format!("customer{n}")))?;
        info!(customer = n, queue = %queue, "Waiting for messages");
        connections.push(conn);
    }

    let producer = broker.connect();
    producer
        .broker()
        .declare_exchange(exchange, ExchangeKind::Fanout)?;
    produce(&producer, exchange, "", "Hello World, this is publisher!", count, interval_ms).await?;

    // let the customers drain before their connections end
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn run_topic(
    broker: &Broker,
    exchange: &str,
    pattern: &str,
    key: &str,
    count: u64,
    interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = broker.connect();
    subscriber
        .broker()
        .declare_exchange(exchange, ExchangeKind::Topic)?;
    let queue = subscriber.declare_queue(None, true)?;
    subscriber.broker().bind(exchange, &queue, pattern)?;
    subscriber
        .broker()
        .consume(&queue, printer("subscriber".to_string()))?;
    info!(queue = %queue, pattern, "Waiting for messages");

    let publisher = broker.connect();
    produce(&publisher, exchange, key, "Hello from topicbus publisher", count, interval_ms).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn produce(
    conn: &Connection,
    exchange: &str,
    key: &str,
    payload: &str,
    count: u64,
    interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let interval = Duration::from_millis(interval_ms);

    let publishing = async {
        let mut sent = 0;
        while count == 0 || sent < count {
            let routed = conn
                .broker()
                .publish(exchange, key, payload.to_string())
                .await?;
            info!(exchange, key, routed, "Sent {:?}", payload);
            sent += 1;
            if count == 0 || sent < count {
                tokio::time::sleep(interval).await;
            }
        }
        Ok::<(), topicbus::BrokerError>(())
    };

    tokio::select! {
        result = publishing => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Publisher stopped.");
        }
    }
    Ok(())
}
