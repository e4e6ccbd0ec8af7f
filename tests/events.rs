// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::wait_for_consumer;
use rabbitmq_patterns::{
    envelope::{HeaderValue, MessageMetadata, MessageProperties},
    errors::HandlerError,
    events::{internal, Event, EventEmitter, EventEmitterOptions, EventListener},
    exchange::RABBITMQ_EVENT_EXCHANGE,
    handler::SubscriberHandler,
    serializer::Message,
    subscriber::{Subscriber, SubscriberOptions},
    transport::{memory::MemoryBroker, Transport},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};

fn forward(tx: mpsc::UnboundedSender<(Message, MessageMetadata)>) -> Arc<dyn SubscriberHandler> {
    Arc::new(
        move |msg: Message, meta: MessageMetadata| -> Result<(), HandlerError> {
            tx.send((msg, meta)).map_err(|_| HandlerError::from("receiver dropped"))
        },
    )
}

async fn broker_event(broker: &MemoryBroker, name: &str) {
    let props = MessageProperties::default()
        .with_header("name", HeaderValue::LongString("amq.gen-test".to_owned()));
    broker
        .open_channel()
        .publish(RABBITMQ_EVENT_EXCHANGE, name, props, vec![])
        .await
        .unwrap();
}

async fn wait_for_binding(broker: &MemoryBroker, key: &str) {
    for _ in 0..200 {
        if broker
            .bindings(RABBITMQ_EVENT_EXCHANGE)
            .iter()
            .any(|binding| binding.key() == key)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let binding = broker
        .bindings(RABBITMQ_EVENT_EXCHANGE)
        .into_iter()
        .find(|binding| binding.key() == key)
        .expect("listener was not bound");
    wait_for_consumer(broker.open_channel().as_ref(), binding.queue_name()).await;
}

#[tokio::test]
async fn listener_receives_only_its_broker_events() {
    let broker = MemoryBroker::new();
    let listener = EventListener::new(Arc::new(broker.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    listener
        .listen(internal::QUEUE_CREATED, forward(tx.clone()))
        .await
        .unwrap();
    listener
        .listen(internal::CONSUMER_CREATED, forward(tx))
        .await
        .unwrap();
    assert_eq!(
        listener.listeners(),
        vec![internal::CONSUMER_CREATED.to_owned(), internal::QUEUE_CREATED.to_owned()]
    );
    wait_for_binding(&broker, internal::QUEUE_CREATED).await;
    wait_for_binding(&broker, internal::CONSUMER_CREATED).await;

    broker_event(&broker, internal::EXCHANGE_DELETED).await;
    broker_event(&broker, internal::QUEUE_CREATED).await;

    let (_, meta) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(meta.routing_key, internal::QUEUE_CREATED);
    assert!(rx.try_recv().is_err());

    assert_eq!(listener.stop(internal::QUEUE_CREATED).await, Ok(true));
    assert_eq!(listener.stop(internal::QUEUE_CREATED).await, Ok(false));
    assert_eq!(listener.listeners(), vec![internal::CONSUMER_CREATED.to_owned()]);

    listener.stop_all().await.unwrap();
    assert!(listener.listeners().is_empty());
    assert!(broker.bindings(RABBITMQ_EVENT_EXCHANGE).is_empty());
}

#[tokio::test]
async fn emitted_events_carry_sequence_numbers() {
    let broker = MemoryBroker::new();
    let emitter = EventEmitter::new(broker.open_channel(), EventEmitterOptions::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Arc::new(
        Subscriber::new(
            broker.open_channel(),
            SubscriberOptions::new("door.*").exchange(emitter.exchange()),
            forward(tx),
        )
        .await
        .unwrap(),
    );
    subscriber.run_threaded().unwrap();
    wait_for_consumer(broker.open_channel().as_ref(), subscriber.queue_name()).await;

    let mut event = Event::new("door.opened", json!({"a": 1})).with_header("b", json!(1));
    emitter.send_event(&mut event).await.unwrap();
    emitter.send_event(&mut event).await.unwrap();

    for expected_seq in 0..2 {
        let (msg, meta) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let received: Event = serde_json::from_value(msg.as_json().unwrap().clone()).unwrap();

        assert_eq!(meta.routing_key, "door.opened");
        assert_eq!(received.name, "door.opened");
        assert_eq!(received.payload, json!({"a": 1}));
        assert_eq!(received.header.seq, expected_seq);
        assert_eq!(received.header.custom["b"], json!(1));
        assert!(received.header.timestamp > 0);
    }

    subscriber.close().await.unwrap();
    assert_eq!(emitter.close().await, Ok(true));
}
