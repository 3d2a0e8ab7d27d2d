//! BusClient contract exercised through the in-process bus

use async_trait::async_trait;
use relay_client::{
    BusClient, ConnectionEvent, ConnectionState, IncomingMessage, MemoryBus, MessageHandler,
    PublishError, QoS, SubscribeError,
};
use std::sync::Arc;
use std::time::Duration;

/// Echoes every delivery to `<topic>/echo` through the bus it was given
struct Echo {
    bus: Arc<dyn BusClient>,
}

#[async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, msg: IncomingMessage) {
        let topic = format!("{}/echo", msg.topic);
        let _ = self.bus.publish(&topic, msg.payload, msg.qos).await;
    }
}

#[tokio::test]
async fn test_handler_publishes_through_trait_object() {
    let memory = MemoryBus::new();
    let bus: Arc<dyn BusClient> = Arc::new(memory.clone());
    let granted = bus
        .subscribe("jobs/#", QoS::AtLeastOnce, Arc::new(Echo { bus: bus.clone() }))
        .await
        .unwrap();
    assert_eq!(granted, QoS::AtLeastOnce);

    memory.deliver("jobs/a", b"one".to_vec(), QoS::AtMostOnce);
    memory.deliver("jobs/b", b"two".to_vec(), QoS::AtLeastOnce);
    assert!(memory.wait_for_publishes(2, Duration::from_secs(2)).await);

    let mut echoed: Vec<(String, QoS)> = memory
        .published()
        .into_iter()
        .map(|m| (m.topic, m.qos))
        .collect();
    echoed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        echoed,
        vec![
            ("jobs/a/echo".to_string(), QoS::AtMostOnce),
            ("jobs/b/echo".to_string(), QoS::AtLeastOnce),
        ]
    );
}

#[tokio::test]
async fn test_resubscribe_replaces_handler() {
    let memory = MemoryBus::new();
    let bus: Arc<dyn BusClient> = Arc::new(memory.clone());
    let echo = Arc::new(Echo { bus: bus.clone() });

    bus.subscribe("in", QoS::AtLeastOnce, echo.clone()).await.unwrap();
    bus.subscribe("in", QoS::AtLeastOnce, echo).await.unwrap();

    assert_eq!(memory.deliver("in", b"x".to_vec(), QoS::AtLeastOnce), 1);
    memory.wait_idle().await;
    assert_eq!(memory.published().len(), 1);
    assert_eq!(memory.subscribe_calls().len(), 2);
}

#[tokio::test]
async fn test_invalid_filter_rejected_locally() {
    let memory = MemoryBus::new();
    let bus: Arc<dyn BusClient> = Arc::new(memory.clone());

    let err = bus
        .subscribe("a/#/b", QoS::AtLeastOnce, Arc::new(Echo { bus: bus.clone() }))
        .await
        .unwrap_err();
    assert!(matches!(err, SubscribeError::InvalidTopic(_)));
    assert!(memory.subscribe_calls().is_empty());
}

#[tokio::test]
async fn test_lifecycle_stream() {
    let memory = MemoryBus::new();
    let bus: Arc<dyn BusClient> = Arc::new(memory.clone());
    let mut events = bus.events();

    memory.interrupt("keep-alive timeout");
    assert_eq!(bus.state(), ConnectionState::Interrupted);
    let err = bus.publish("out", vec![], QoS::AtLeastOnce).await.unwrap_err();
    assert!(matches!(err, PublishError::NotConnected(_)));

    memory.resume(true);
    bus.disconnect().await.unwrap();
    // second disconnect is a no-op
    bus.disconnect().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionEvent::Interrupted {
                error: "keep-alive timeout".to_string()
            },
            ConnectionEvent::Resumed {
                session_present: true
            },
            ConnectionEvent::Closed,
        ]
    );
}
