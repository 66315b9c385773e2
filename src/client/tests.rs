use crate::broker::{Broker, ExchangeKind, HandlerResult, Message, QueueOptions};
use crate::utils::error::BrokerError;

#[tokio::test]
async fn test_connection_ids_are_unique() {
    let broker = Broker::default();
    let a = broker.connect();
    let b = broker.connect();
    assert!(a.id().starts_with("conn-"));
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn test_close_deletes_exclusive_queues_only() {
    let broker = Broker::default();
    broker.declare_exchange("pubsub", ExchangeKind::Fanout).unwrap();

    let conn = broker.connect();
    let exclusive = conn.declare_queue(None, true).unwrap();
    let shared = conn.declare_queue(Some("shared"), false).unwrap();
    conn.broker().bind("pubsub", &exclusive, "").unwrap();
    conn.broker().bind("pubsub", &shared, "").unwrap();

    assert_eq!(conn.close(), 1);

    assert!(matches!(
        broker.queue_info(&exclusive),
        Err(BrokerError::NotFound { .. })
    ));
    assert!(broker.queue_info(&shared).is_ok());
    assert_eq!(broker.publish("pubsub", "", "x").await.unwrap(), 1);
}

#[tokio::test]
async fn test_drop_releases_exclusive_queues() {
    let broker = Broker::default();
    let queue = {
        let conn = broker.connect();
        conn.declare_queue(None, true).unwrap()
    };
    assert!(broker.queue_info(&queue).is_err());
    assert!(broker.queues().unwrap().is_empty());
}

#[tokio::test]
async fn test_exclusive_queue_is_locked_to_its_connection() {
    let broker = Broker::default();
    let owner = broker.connect();
    let other = broker.connect();

    let queue = owner.declare_queue(Some("private"), true).unwrap();
    assert_eq!(owner.declare_queue(Some("private"), true).unwrap(), queue);
    assert!(matches!(
        other.declare_queue(Some("private"), true),
        Err(BrokerError::Conflict(_))
    ));

    drop(owner);
    // the name is free again once the owner is gone
    assert!(other.declare_queue(Some("private"), true).is_ok());
}

#[tokio::test]
async fn test_close_after_shutdown_is_harmless() {
    let broker = Broker::default();
    let conn = broker.connect();
    conn.declare_queue(None, true).unwrap();
    broker.shutdown().await;
    assert_eq!(conn.close(), 0);
}

#[tokio::test]
async fn test_close_deletes_auto_delete_queues() {
    let broker = Broker::default();
    broker.declare_exchange("pubsub", ExchangeKind::Fanout).unwrap();
    let auto_delete = QueueOptions {
        exclusive: false,
        auto_delete: true,
    };
    let shared = broker
        .declare_queue_with(Some("shared"), auto_delete)
        .unwrap();
    broker.bind("pubsub", &shared, "").unwrap();

    let conn = broker.connect();
    let queue = conn
        .declare_queue_with(None, auto_delete)
        .unwrap();
    conn.broker().bind("pubsub", &queue, "").unwrap();
    conn.broker()
        .consume(&queue, |_msg: Message| -> HandlerResult { Ok(()) })
        .unwrap();

    assert_eq!(conn.close(), 1);

    assert!(matches!(
        broker.queue_info(&queue),
        Err(BrokerError::NotFound { .. })
    ));
    // not owned by the connection, so it stays
    assert!(broker.queue_info(&shared).is_ok());
    assert_eq!(broker.publish("pubsub", "", "x").await.unwrap(), 1);
}
