// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Transport
//!
//! A small in-process broker implementing the same contract as the AMQP
//! transport: default, direct, topic and fanout routing, server-named queues,
//! length-bounded queues, round-robin consumers and direct reply-to. Each
//! `channel()` call hands out an independent `MemoryTransport` on the shared
//! broker state.
//!
//! Prefetch limits are recorded but not enforced; every consumer receives
//! deliveries as soon as they are routed.

use super::{
    ConsumeOptions, ConsumerHandle, Connector, QueueInfo, Transport, DIRECT_REPLY_TO,
};
use crate::{
    envelope::{now_millis, Delivery, HeaderValue, MessageProperties, HEADER_BROKER_TIMESTAMP},
    errors::AmqpError,
    exchange::{
        ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE, RABBITMQ_EVENT_EXCHANGE, TOPIC_EXCHANGE,
    },
    queue::{Overflow, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

struct MemoryConsumer {
    tag: String,
    channel: u64,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct MemoryQueue {
    max_length: Option<usize>,
    overflow: Overflow,
    buffer: VecDeque<Delivery>,
    consumers: Vec<MemoryConsumer>,
    next: usize,
}

impl MemoryQueue {
    fn new(def: &QueueDefinition) -> Self {
        MemoryQueue {
            max_length: def.max_length.map(|max| max.max(0) as usize),
            overflow: def.overflow.unwrap_or_default(),
            buffer: VecDeque::new(),
            consumers: vec![],
            next: 0,
        }
    }

    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.next % self.consumers.len();
            match self.consumers[idx].sender.send(delivery) {
                Ok(()) => {
                    self.next = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }

        if let Some(max) = self.max_length {
            if self.buffer.len() >= max {
                match self.overflow {
                    Overflow::DropHead if max > 0 => {
                        self.buffer.pop_front();
                    }
                    _ => {
                        debug!("queue full, dropping message");
                        return;
                    }
                }
            }
        }
        self.buffer.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    next_delivery_tag: u64,
    next_consumer: u64,
    acked: Vec<u64>,
}

impl BrokerState {
    fn routes(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = match kind {
            ExchangeKind::Default => {
                if self.queues.contains_key(routing_key) {
                    vec![routing_key.to_owned()]
                } else {
                    vec![]
                }
            }
            _ => self
                .bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    _ => true,
                })
                .map(|b| b.queue_name.clone())
                .collect(),
        };
        targets.sort();
        targets.dedup();
        targets
    }
}

/// Returns whether a topic binding pattern matches a routing key.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    channels: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    /// Creates a broker with the standard `amq.*` exchanges pre-declared.
    pub fn new() -> Self {
        let mut state = BrokerState::default();
        for (name, kind) in [
            (DEFAULT_EXCHANGE, ExchangeKind::Default),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.headers", ExchangeKind::Headers),
            (TOPIC_EXCHANGE, ExchangeKind::Topic),
            (RABBITMQ_EVENT_EXCHANGE, ExchangeKind::Topic),
        ] {
            state.exchanges.insert(name.to_owned(), kind);
        }

        MemoryBroker {
            state: Arc::new(Mutex::new(state)),
            channels: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens a new channel on the broker.
    pub fn open_channel(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            id: self.channels.fetch_add(1, Ordering::SeqCst),
            broker: self.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
        })
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Messages waiting in `name` for a consumer.
    pub fn queued(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.buffer.len())
            .unwrap_or_default()
    }

    /// Delivery tags acknowledged so far, in order.
    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn bindings(&self, exchange: &str) -> Vec<QueueBinding> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn channel(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        Ok(self.open_channel())
    }
}

/// One channel on a `MemoryBroker`.
pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryTransport {
    pub fn prefetch(&self) -> u16 {
        self.prefetch.load(Ordering::SeqCst)
    }

    fn reply_queue(&self) -> String {
        format!("{}.{}", DIRECT_REPLY_TO, self.id)
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if def.kind == ExchangeKind::Default {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        let mut state = self.broker.lock();
        match state.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => {
                warn!(name = def.name, "exchange redeclared with a different type");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        self.ensure_open()?;
        Ok(self.broker.lock().exchanges.contains_key(name))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;
        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        let mut state = self.broker.lock();
        if def.passive && !state.queues.contains_key(&name) {
            return Err(AmqpError::DeclareQueueError(name));
        }
        state
            .queues
            .entry(name.clone())
            .or_insert_with(|| MemoryQueue::new(def));

        Ok(name)
    }

    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>, AmqpError> {
        self.ensure_open()?;
        Ok(self.broker.lock().queues.get(name).map(|q| QueueInfo {
            message_count: q.buffer.len() as u32,
            consumer_count: q.consumers.len() as u32,
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue_name != name);
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Vec<u8>,
    ) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::PublishingError)?;

        let mut properties = properties;
        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_TO) {
            properties.reply_to = Some(self.reply_queue());
        }
        properties.headers.insert(
            HEADER_BROKER_TIMESTAMP.to_owned(),
            HeaderValue::LongLongInt(now_millis() as i64),
        );

        let mut state = self.broker.lock();
        let Some(kind) = state.exchanges.get(exchange).copied() else {
            warn!(exchange = exchange, "publish to missing exchange");
            return Err(AmqpError::PublishingError);
        };

        for queue in state.routes(exchange, kind, routing_key) {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_delivery_tag,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties: properties.clone(),
                data: payload.clone(),
            };
            if let Some(q) = state.queues.get_mut(&queue) {
                q.deliver(delivery);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        let name = if queue == DIRECT_REPLY_TO {
            let name = self.reply_queue();
            state
                .queues
                .entry(name.clone())
                .or_insert_with(|| MemoryQueue::new(&QueueDefinition::new(&name)));
            name
        } else {
            queue.to_owned()
        };

        state.next_consumer += 1;
        let tag = format!("ctag-{}.{}", self.id, state.next_consumer);

        let Some(q) = state.queues.get_mut(&name) else {
            return Err(AmqpError::ConsumerDeclarationError(name));
        };
        if q.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !q.consumers.is_empty())
        {
            return Err(AmqpError::ConsumerDeclarationError(name));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for delivery in q.buffer.drain(..) {
            let _ = sender.send(delivery);
        }
        q.consumers.push(MemoryConsumer {
            tag: tag.clone(),
            channel: self.id,
            exclusive: options.exclusive,
            sender,
        });

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed();

        Ok(ConsumerHandle { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        self.broker.lock().acked.push(delivery_tag);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let reply_queue = self.reply_queue();
        let mut state = self.broker.lock();
        state.queues.remove(&reply_queue);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(body: &str) -> (MessageProperties, Vec<u8>) {
        (
            MessageProperties::default().with_content_type("text/plain"),
            body.as_bytes().to_vec(),
        )
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("sensors.*.temp", "sensors.kitchen.temp"));
        assert!(!topic_matches("sensors.*.temp", "sensors.temp"));
        assert!(topic_matches("sensors.#", "sensors"));
        assert!(topic_matches("sensors.#", "sensors.a.b.c"));
        assert!(topic_matches("#.temp", "a.b.temp"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("sensors.temp", "sensors.humidity"));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        channel.declare_queue(&QueueDefinition::new("work")).await.unwrap();

        let (props, body) = text("hello");
        channel.publish("", "work", props, body).await.unwrap();
        channel
            .publish("", "nowhere", MessageProperties::default(), vec![])
            .await
            .unwrap();

        assert_eq!(broker.queued("work"), 1);

        let mut consumer = channel.consume("work", ConsumeOptions::default()).await.unwrap();
        let delivery = consumer.deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, b"hello".to_vec());
        assert!(delivery.properties.headers.contains_key(HEADER_BROKER_TIMESTAMP));
    }

    #[tokio::test]
    async fn bounded_queue_drops_head() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        let name = channel
            .declare_queue(&QueueDefinition::new("").max_length(2).overflow(Overflow::DropHead))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new(&name).exchange(TOPIC_EXCHANGE).routing_key("t"))
            .await
            .unwrap();

        for body in ["1", "2", "3"] {
            let (props, payload) = text(body);
            channel.publish(TOPIC_EXCHANGE, "t", props, payload).await.unwrap();
        }

        let mut consumer = channel.consume(&name, ConsumeOptions::default()).await.unwrap();
        let first = consumer.deliveries.next().await.unwrap().unwrap();
        let second = consumer.deliveries.next().await.unwrap().unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert_eq!(first.data, b"2".to_vec());
        assert_eq!(second.data, b"3".to_vec());
    }

    #[tokio::test]
    async fn consumers_share_a_queue_round_robin() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        channel.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();

        let mut a = channel.consume("jobs", ConsumeOptions::default()).await.unwrap();
        let mut b = channel.consume("jobs", ConsumeOptions::default()).await.unwrap();

        for body in ["1", "2"] {
            let (props, payload) = text(body);
            channel.publish("", "jobs", props, payload).await.unwrap();
        }

        assert_eq!(a.deliveries.next().await.unwrap().unwrap().data, b"1".to_vec());
        assert_eq!(b.deliveries.next().await.unwrap().unwrap().data, b"2".to_vec());
    }

    #[tokio::test]
    async fn direct_reply_to_is_private_to_the_channel() {
        let broker = MemoryBroker::new();
        let client = broker.open_channel();
        let server = broker.open_channel();
        server.declare_queue(&QueueDefinition::new("rpc")).await.unwrap();

        let mut replies = client.consume(DIRECT_REPLY_TO, ConsumeOptions::default()).await.unwrap();
        let mut requests = server.consume("rpc", ConsumeOptions::default()).await.unwrap();

        client
            .publish(
                "",
                "rpc",
                MessageProperties::default().with_reply_to(DIRECT_REPLY_TO),
                b"ping".to_vec(),
            )
            .await
            .unwrap();

        let request = requests.deliveries.next().await.unwrap().unwrap();
        let reply_to = request.properties.reply_to.unwrap();
        assert_ne!(reply_to, DIRECT_REPLY_TO);

        server
            .publish("", &reply_to, MessageProperties::default(), b"pong".to_vec())
            .await
            .unwrap();

        let reply = replies.deliveries.next().await.unwrap().unwrap();
        assert_eq!(reply.data, b"pong".to_vec());
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        channel.close().await.unwrap();

        assert!(!channel.is_open());
        assert_eq!(
            channel.publish("", "q", MessageProperties::default(), vec![]).await,
            Err(AmqpError::PublishingError)
        );
        assert_eq!(channel.ack(1).await, Err(AmqpError::AckMessageError));
    }

    #[tokio::test]
    async fn exchange_redeclared_with_other_kind_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();

        let result = channel
            .declare_exchange(&ExchangeDefinition::new(TOPIC_EXCHANGE).fanout())
            .await;

        assert_eq!(
            result,
            Err(AmqpError::DeclareExchangeError(TOPIC_EXCHANGE.to_owned()))
        );
    }
}
