// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events
//!
//! Two event flavours share this module:
//!
//! - Application events: [`EventEmitter`] publishes [`Event`]s to a topic
//!   exchange (`events` by default) using the event name as routing key.
//! - Broker events: [`EventListener`] subscribes to RabbitMQ's internal
//!   `amq.rabbitmq.event` exchange (event exchange plugin). Event names are
//!   listed in [`internal`].

use crate::{
    envelope::{now_millis, Headers},
    errors::AmqpError,
    exchange::{ExchangeKind, RABBITMQ_EVENT_EXCHANGE},
    handler::SubscriberHandler,
    publisher::{Publisher, PublisherOptions},
    serializer::Message,
    subscriber::{Subscriber, SubscriberOptions},
    transport::{Connector, Transport},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_EVENTS_EXCHANGE: &str = "events";
pub const DEFAULT_AGENT: &str = env!("CARGO_PKG_NAME");

/// RabbitMQ internal event names.
pub mod internal {
    pub const QUEUE_CREATED: &str = "queue.created";
    pub const QUEUE_DELETED: &str = "queue.deleted";
    pub const EXCHANGE_CREATED: &str = "exchange.created";
    pub const EXCHANGE_DELETED: &str = "exchange.deleted";
    pub const BINDING_CREATED: &str = "binding.created";
    pub const BINDING_DELETED: &str = "binding.deleted";
    pub const CONNECTION_CREATED: &str = "connection.created";
    pub const CONNECTION_CLOSED: &str = "connection.closed";
    pub const CHANNEL_CREATED: &str = "channel.created";
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    pub const CONSUMER_CREATED: &str = "consumer.created";
    pub const CONSUMER_DELETED: &str = "consumer.deleted";
    pub const USER_AUTH_OK: &str = "user.authentication.success";
    pub const USER_AUTH_FAILED: &str = "user.authentication.failure";
    pub const USER_CREATED: &str = "user.created";
    pub const USER_DELETED: &str = "user.deleted";
    pub const USER_PASSWORD_CHANGED: &str = "user.password.changed";
    pub const USER_PASSWORD_CLEARED: &str = "user.password.cleared";
    pub const USER_TAGS_SET: &str = "user.tags.set";
}

/// Monotonic sequence numbers, starting at 0.
#[derive(Debug)]
pub struct SequenceGenerator {
    last: AtomicI64,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        SequenceGenerator {
            last: AtomicI64::new(-1),
        }
    }
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last number handed out, `-1` before the first.
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Send time in ms since epoch, `-1` until sent.
    pub timestamp: i64,
    /// Emitter sequence number, `-1` until sent.
    pub seq: i64,
    pub agent: String,
    pub custom: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub header: EventHeader,
}

impl Event {
    pub fn new(name: &str, payload: Value) -> Self {
        Event {
            name: name.to_owned(),
            payload,
            header: EventHeader {
                timestamp: -1,
                seq: -1,
                agent: DEFAULT_AGENT.to_owned(),
                custom: Map::new(),
            },
        }
    }

    /// Adds a custom header entry.
    pub fn with_header(mut self, key: &str, value: Value) -> Self {
        self.header.custom.insert(key.to_owned(), value);
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.header.agent = agent.to_owned();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEmitterOptions {
    pub(crate) exchange: String,
}

impl Default for EventEmitterOptions {
    fn default() -> Self {
        EventEmitterOptions {
            exchange: DEFAULT_EVENTS_EXCHANGE.to_owned(),
        }
    }
}

impl EventEmitterOptions {
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }
}

pub struct EventEmitter {
    publisher: Publisher,
    sequence: SequenceGenerator,
}

impl EventEmitter {
    /// Declares the events topic exchange when missing.
    pub async fn new(
        transport: Arc<dyn Transport>,
        options: EventEmitterOptions,
    ) -> Result<EventEmitter, AmqpError> {
        let publisher = Publisher::new(
            transport,
            PublisherOptions::new("").exchange(&options.exchange, ExchangeKind::Topic),
        )
        .await?;

        Ok(EventEmitter {
            publisher,
            sequence: SequenceGenerator::new(),
        })
    }

    pub fn exchange(&self) -> &str {
        self.publisher.exchange()
    }

    /// Stamps `event` with the next sequence number and the send time, then
    /// publishes it under its name.
    pub async fn send_event(&self, event: &mut Event) -> Result<(), AmqpError> {
        event.header.seq = self.sequence.next();
        event.header.timestamp = i64::try_from(now_millis()).unwrap_or(i64::MAX);

        let body = serde_json::to_value(&*event).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize event");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        debug!(event = event.name, seq = event.header.seq, "sending event");
        self.publisher
            .publish_with(&event.name, &Message::Json(body), Headers::new())
            .await
    }

    pub async fn close(&self) -> Result<bool, AmqpError> {
        self.publisher.close().await
    }
}

struct Listener {
    subscriber: Arc<Subscriber>,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl Listener {
    async fn stop(self, event: &str) -> Result<bool, AmqpError> {
        let closed = self.subscriber.close().await?;
        match self.task.await {
            Ok(Err(err)) => {
                warn!(event = event, error = err.to_string(), "listener ended with error")
            }
            Err(err) => warn!(event = event, error = err.to_string(), "listener task failed"),
            Ok(Ok(())) => {}
        }
        Ok(closed)
    }
}

/// Listens to broker internal events, one background subscriber per event name.
pub struct EventListener {
    connector: Arc<dyn Connector>,
    exchange: String,
    listeners: Mutex<HashMap<String, Listener>>,
}

impl EventListener {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        EventListener {
            connector,
            exchange: RABBITMQ_EVENT_EXCHANGE.to_owned(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a listener for `event` on its own channel. A previous listener
    /// for the same event is stopped.
    pub async fn listen(
        &self,
        event: &str,
        handler: Arc<dyn SubscriberHandler>,
    ) -> Result<(), AmqpError> {
        let transport = self.connector.channel().await?;
        let subscriber = Arc::new(
            Subscriber::new(
                transport,
                SubscriberOptions::new(event).exchange(&self.exchange),
                handler,
            )
            .await?,
        );
        let task = subscriber.run_threaded()?;
        info!(event = event, "listening to broker event");

        let previous = self
            .lock()
            .insert(event.to_owned(), Listener { subscriber, task });
        if let Some(previous) = previous {
            previous.stop(event).await?;
        }

        Ok(())
    }

    /// Stops the listener for `event`. Returns false when there was none.
    pub async fn stop(&self, event: &str) -> Result<bool, AmqpError> {
        let listener = self.lock().remove(event);
        match listener {
            Some(listener) => listener.stop(event).await,
            None => Ok(false),
        }
    }

    pub async fn stop_all(&self) -> Result<(), AmqpError> {
        let listeners: Vec<(String, Listener)> = self.lock().drain().collect();
        for (event, listener) in listeners {
            listener.stop(&event).await?;
        }
        Ok(())
    }

    /// Names of the events currently listened to, sorted.
    pub fn listeners(&self) -> Vec<String> {
        let mut events: Vec<String> = self.lock().keys().cloned().collect();
        events.sort();
        events
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
