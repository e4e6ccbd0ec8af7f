// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::wait_for_consumer;
use rabbitmq_patterns::{
    envelope::MessageMetadata,
    errors::{AmqpError, HandlerError},
    exchange::TOPIC_EXCHANGE,
    handler::SubscriberHandler,
    publisher::{Publisher, PublisherOptions},
    serializer::Message,
    subscriber::{Subscriber, SubscriberOptions},
    transport::memory::MemoryBroker,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};

fn collect() -> (
    Arc<dyn SubscriberHandler>,
    mpsc::UnboundedReceiver<(Message, MessageMetadata)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn SubscriberHandler> = Arc::new(
        move |msg: Message, meta: MessageMetadata| -> Result<(), HandlerError> {
            tx.send((msg, meta)).map_err(|_| HandlerError::from("receiver dropped"))
        },
    );
    (handler, rx)
}

async fn next(
    rx: &mut mpsc::UnboundedReceiver<(Message, MessageMetadata)>,
) -> (Message, MessageMetadata) {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message received in time")
        .expect("handler dropped")
}

#[tokio::test]
async fn wildcard_subscription_receives_messages_with_metadata() {
    let broker = MemoryBroker::new();
    let (handler, mut rx) = collect();

    let subscriber = Arc::new(
        Subscriber::new(
            broker.open_channel(),
            SubscriberOptions::new("sensors.*"),
            handler,
        )
        .await
        .unwrap(),
    );
    subscriber.run_threaded().unwrap();
    wait_for_consumer(broker.open_channel().as_ref(), subscriber.queue_name()).await;

    let temp = Publisher::new(broker.open_channel(), PublisherOptions::new("sensors.temp"))
        .await
        .unwrap();
    let other = Publisher::new(broker.open_channel(), PublisherOptions::new("actuators.fan"))
        .await
        .unwrap();

    other.publish(&Message::Json(json!({"rpm": 900}))).await.unwrap();
    temp.publish(&Message::Json(json!({"celsius": 21}))).await.unwrap();

    let (msg, meta) = next(&mut rx).await;
    assert_eq!(msg, Message::Json(json!({"celsius": 21})));
    assert_eq!(meta.routing_key, "sensors.temp");
    assert_eq!(meta.exchange, TOPIC_EXCHANGE);
    assert_eq!(meta.content_type.as_deref(), Some("application/json"));
    assert_eq!(meta.content_encoding.as_deref(), Some("utf8"));
    assert_eq!(meta.delivery_mode, Some(1));
    assert!(meta.timestamp_producer.is_some());
    assert!(meta.timestamp_broker.is_some());
    assert!(rx.try_recv().is_err());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn rate_tracks_the_publishing_frequency() {
    let broker = MemoryBroker::new();
    let (handler, mut rx) = collect();

    let subscriber = Arc::new(
        Subscriber::new(broker.open_channel(), SubscriberOptions::new("tick"), handler)
            .await
            .unwrap(),
    );
    subscriber.run_threaded().unwrap();
    wait_for_consumer(broker.open_channel().as_ref(), subscriber.queue_name()).await;

    let publisher = Publisher::new(broker.open_channel(), PublisherOptions::new("tick"))
        .await
        .unwrap();
    for _ in 0..15 {
        publisher.publish(&Message::Text("tick".into())).await.unwrap();
        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let hz = subscriber.rate();
    assert!(hz > 8.0 && hz < 21.0, "rate was {hz}");

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn idle_subscriber_queue_keeps_only_the_newest_messages() {
    let broker = MemoryBroker::new();
    let (handler, _rx) = collect();

    let subscriber = Subscriber::new(
        broker.open_channel(),
        SubscriberOptions::new("burst").queue_size(3),
        handler,
    )
    .await
    .unwrap();

    let publisher = Publisher::new(broker.open_channel(), PublisherOptions::new("burst"))
        .await
        .unwrap();
    for n in 0..5 {
        publisher.publish(&Message::Json(json!(n))).await.unwrap();
    }

    assert_eq!(broker.queued(subscriber.queue_name()), 3);
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn close_removes_the_queue_but_not_the_exchange() {
    let broker = MemoryBroker::new();
    let (handler, _rx) = collect();

    let subscriber = Arc::new(
        Subscriber::new(
            broker.open_channel(),
            SubscriberOptions::new("logs.#").exchange("logs"),
            handler,
        )
        .await
        .unwrap(),
    );
    let queue = subscriber.queue_name().to_owned();
    let running = subscriber.run_threaded().unwrap();

    assert!(broker.has_exchange("logs"));
    assert_eq!(broker.bindings("logs").len(), 1);

    assert_eq!(subscriber.close().await, Ok(true));
    assert_eq!(subscriber.close().await, Ok(false));
    assert_eq!(running.await.unwrap(), Ok(()));

    assert!(!broker.has_queue(&queue));
    assert!(broker.has_exchange("logs"));
    assert!(broker.bindings("logs").is_empty());
    assert_eq!(subscriber.run().await, Err(AmqpError::ChannelClosed));
}

#[tokio::test]
async fn reliable_subscriber_acknowledges_deliveries() {
    let broker = MemoryBroker::new();
    let (handler, mut rx) = collect();

    let subscriber = Arc::new(
        Subscriber::new(
            broker.open_channel(),
            SubscriberOptions::new("jobs").reliable(),
            handler,
        )
        .await
        .unwrap(),
    );
    subscriber.run_threaded().unwrap();
    wait_for_consumer(broker.open_channel().as_ref(), subscriber.queue_name()).await;

    let publisher = Publisher::new(broker.open_channel(), PublisherOptions::new("jobs"))
        .await
        .unwrap();
    publisher.publish(&Message::Text("job".into())).await.unwrap();

    let (_, meta) = next(&mut rx).await;
    for _ in 0..100 {
        if broker.acked().contains(&meta.delivery_tag) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(broker.acked().contains(&meta.delivery_tag));

    subscriber.close().await.unwrap();
}
