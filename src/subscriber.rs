// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Subscriber
//!
//! Binds a private, bounded queue to a topic exchange and feeds every delivery
//! to a [`SubscriberHandler`], keeping a live estimate of the incoming rate.

use crate::{
    consumer::{ConsumeControl, ConsumerState},
    envelope::{Delivery, MessageMetadata},
    errors::AmqpError,
    exchange::{ExchangeDefinition, TOPIC_EXCHANGE},
    handler::SubscriberHandler,
    queue::{Overflow, QueueDefinition},
    rate::RateEstimator,
    serializer::{decode_or_raw, JsonSerializer, Serializer},
    topology::{declare_bound_queue, ensure_exchange},
    transport::{ConsumeOptions, Transport},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_SIZE: i32 = 10;
pub const DEFAULT_MESSAGE_TTL_MS: i32 = 60_000;
pub const DEFAULT_QUEUE_EXPIRES_MS: i32 = 300_000;

/// Subscription settings. The queue bounds apply to the subscriber's own queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOptions {
    pub(crate) topic: String,
    pub(crate) exchange: String,
    pub(crate) queue_size: i32,
    pub(crate) message_ttl: i32,
    pub(crate) overflow: Overflow,
    pub(crate) expires: i32,
    pub(crate) reliable: bool,
}

impl SubscriberOptions {
    /// Subscribes to `topic`, which may hold `*` and `#` wildcards, on `amq.topic`.
    pub fn new(topic: &str) -> Self {
        SubscriberOptions {
            topic: topic.to_owned(),
            exchange: TOPIC_EXCHANGE.to_owned(),
            queue_size: DEFAULT_QUEUE_SIZE,
            message_ttl: DEFAULT_MESSAGE_TTL_MS,
            overflow: Overflow::DropHead,
            expires: DEFAULT_QUEUE_EXPIRES_MS,
            reliable: false,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn queue_size(mut self, size: i32) -> Self {
        self.queue_size = size;
        self
    }

    pub fn message_ttl(mut self, ttl_ms: i32) -> Self {
        self.message_ttl = ttl_ms;
        self
    }

    pub fn overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn expires(mut self, expires_ms: i32) -> Self {
        self.expires = expires_ms;
        self
    }

    /// Acknowledge each delivery after the handler returns instead of on delivery.
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    fn queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new("")
            .exclusive()
            .max_length(self.queue_size)
            .overflow(self.overflow)
            .ttl(self.message_ttl)
            .expires(self.expires)
    }
}

pub struct Subscriber {
    transport: Arc<dyn Transport>,
    options: SubscriberOptions,
    queue: String,
    handler: Arc<dyn SubscriberHandler>,
    serializer: Arc<dyn Serializer>,
    rate: RateEstimator,
    control: ConsumeControl,
}

impl Subscriber {
    pub async fn new(
        transport: Arc<dyn Transport>,
        options: SubscriberOptions,
        handler: Arc<dyn SubscriberHandler>,
    ) -> Result<Subscriber, AmqpError> {
        Self::with_serializer(transport, options, handler, Arc::new(JsonSerializer)).await
    }

    pub async fn with_serializer(
        transport: Arc<dyn Transport>,
        options: SubscriberOptions,
        handler: Arc<dyn SubscriberHandler>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Subscriber, AmqpError> {
        ensure_exchange(
            transport.as_ref(),
            &ExchangeDefinition::new(&options.exchange).topic(),
        )
        .await?;

        let queue = declare_bound_queue(
            transport.as_ref(),
            &options.queue_definition(),
            &options.exchange,
            &options.topic,
        )
        .await?;
        debug!(topic = options.topic, queue = queue, "subscription ready");

        Ok(Subscriber {
            transport,
            options,
            queue,
            handler,
            serializer,
            rate: RateEstimator::default(),
            control: ConsumeControl::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Incoming message rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate.rate()
    }

    pub fn state(&self) -> ConsumerState {
        self.control.state()
    }

    /// Consumes on the calling task until the subscriber is closed.
    pub async fn run(&self) -> Result<(), AmqpError> {
        self.control.start()?;
        self.consume_loop().await
    }

    pub fn run_threaded(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<(), AmqpError>>, AmqpError> {
        self.control.start()?;
        let subscriber = Arc::clone(self);
        Ok(tokio::spawn(async move { subscriber.consume_loop().await }))
    }

    /// Stops consuming, deletes the subscriber queue and closes the channel.
    /// The exchange is left in place.
    ///
    /// Returns false when already closed.
    pub async fn close(&self) -> Result<bool, AmqpError> {
        let Some(tag) = self.control.shutdown(self.transport.is_open()) else {
            warn!(topic = self.options.topic, "channel was already closed");
            return Ok(false);
        };

        if let Some(tag) = tag {
            if let Err(err) = self.transport.cancel(&tag).await {
                warn!(error = err.to_string(), "failure to cancel subscriber");
            }
        }

        self.transport.delete_queue(&self.queue).await?;
        self.transport.close().await?;
        info!(topic = self.options.topic, "subscriber closed");

        Ok(true)
    }

    async fn consume_loop(&self) -> Result<(), AmqpError> {
        info!(
            topic = self.options.topic,
            exchange = self.options.exchange,
            "subscribed"
        );

        self.control
            .drive(
                self.transport.as_ref(),
                &self.queue,
                ConsumeOptions {
                    no_ack: !self.options.reliable,
                    exclusive: false,
                },
                |delivery| self.on_message(delivery),
            )
            .await
    }

    async fn on_message(&self, delivery: Delivery) -> Result<(), AmqpError> {
        let meta = MessageMetadata::from(&delivery);
        let msg = decode_or_raw(
            self.serializer.as_ref(),
            &delivery.data,
            meta.content_type.as_deref(),
            meta.content_encoding.as_deref(),
        );

        self.rate.tick();

        if let Err(err) = self.handler.on_message(msg, meta).await {
            warn!(
                topic = self.options.topic,
                error = err.to_string(),
                "subscriber handler failed"
            );
        }

        if self.options.reliable {
            self.transport.ack(delivery.delivery_tag).await?;
        }

        Ok(())
    }
}
