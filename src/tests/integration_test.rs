use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::broker::{Broker, ExchangeKind, HandlerResult, Message};
use crate::config::Settings;

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler channel closed")
}

fn forward_to(tx: mpsc::UnboundedSender<Message>) -> impl Fn(Message) -> HandlerResult + Send + Sync + 'static {
    move |msg: Message| -> HandlerResult {
        tx.send(msg).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// One producer, two consumers on a fanout exchange, each on its own
/// exclusive anonymous queue.
#[tokio::test]
async fn integration_fanout_producer_and_two_customers() {
    let broker = Broker::new(Settings::default().broker);

    let mut customers = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..2 {
        let conn = broker.connect();
        conn.broker()
            .declare_exchange("pubsub", ExchangeKind::Fanout)
            .unwrap();
        let queue = conn.declare_queue(None, true).unwrap();
        conn.broker().bind("pubsub", &queue, "").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        conn.broker().consume(&queue, forward_to(tx)).unwrap();
        customers.push(rx);
        connections.push(conn);
    }

    let producer = broker.connect();
    producer
        .broker()
        .declare_exchange("pubsub", ExchangeKind::Fanout)
        .unwrap();
    let delivered = producer
        .broker()
        .publish("pubsub", "", "Hello World, this is publisher!")
        .await
        .unwrap();
    producer.close();
    assert_eq!(delivered, 2);

    for rx in customers.iter_mut() {
        assert_eq!(next(rx).await.payload_lossy(), "Hello World, this is publisher!");
    }

    // customers disconnect: their queues vanish and publishes become unroutable
    connections.clear();
    assert!(broker.queues().unwrap().is_empty());
    assert_eq!(broker.publish("pubsub", "", "late").await.unwrap(), 0);
}

/// Subscriber binds with the slash-delimited key the sensor scripts use.
#[tokio::test]
async fn integration_topic_exchange_with_slash_keys() {
    let broker = Broker::default();
    broker
        .declare_exchange("amq.topic", ExchangeKind::Topic)
        .unwrap();

    let conn = broker.connect();
    let queue = conn.declare_queue(None, true).unwrap();
    broker.bind("amq.topic", &queue, "test/topic").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker.consume(&queue, forward_to(tx)).unwrap();

    for _ in 0..3 {
        let n = broker
            .publish("amq.topic", "test/topic", "Hello from Python MQTT Publisher")
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
    assert_eq!(
        broker
            .publish("amq.topic", "sensor/accel/xyz", "{\"x\":0.1}")
            .await
            .unwrap(),
        0
    );

    for _ in 0..3 {
        let msg = next(&mut rx).await;
        assert_eq!(&*msg.routing_key, "test/topic");
    }
    assert_eq!(broker.queue_info(&queue).unwrap().delivered, 3);
}

/// Several producers publish concurrently to one queue; each producer's
/// messages arrive in the order that producer sent them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_producers_keep_their_own_order() {
    let broker = Broker::default();
    broker.declare_exchange("events", ExchangeKind::Topic).unwrap();
    let queue = broker.declare_queue(Some("audit"), false).unwrap();
    broker.bind("events", &queue, "producer.#").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker.consume(&queue, forward_to(tx)).unwrap();

    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let mut tasks = Vec::new();
    for p in 0..PRODUCERS {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                let key = format!("producer.{p}");
                broker.publish("events", &key, i.to_string()).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut last_seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let msg = next(&mut rx).await;
        let index: usize = msg.payload_lossy().parse().unwrap();
        if let Some(previous) = last_seen.insert(msg.routing_key.to_string(), index) {
            assert!(index > previous, "out of order for {}", msg.routing_key);
        }
    }
    assert!(last_seen.values().all(|&i| i == PER_PRODUCER - 1));

    broker.shutdown().await;
}
