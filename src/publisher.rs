// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Publisher
//!
//! Publishes messages to a topic exchange, declaring it first when missing.
//! Each message carries the producer timestamp, a message id and the current
//! OpenTelemetry context in its headers.

use crate::{
    envelope::{now_millis, Headers, MessageProperties, DELIVERY_MODE_TRANSIENT},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE, TOPIC_EXCHANGE},
    otel,
    serializer::{JsonSerializer, Message, Serializer},
    topology::ensure_exchange,
    transport::Transport,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    pub(crate) exchange: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) topic: String,
}

impl PublisherOptions {
    /// Publishes to `topic` on `amq.topic`.
    pub fn new(topic: &str) -> Self {
        PublisherOptions {
            exchange: TOPIC_EXCHANGE.to_owned(),
            kind: ExchangeKind::Topic,
            topic: topic.to_owned(),
        }
    }

    pub fn exchange(mut self, exchange: &str, kind: ExchangeKind) -> Self {
        self.exchange = exchange.to_owned();
        self.kind = kind;
        self
    }
}

pub struct Publisher {
    transport: Arc<dyn Transport>,
    options: PublisherOptions,
    serializer: Arc<dyn Serializer>,
    sent: AtomicU64,
}

impl Publisher {
    pub async fn new(
        transport: Arc<dyn Transport>,
        options: PublisherOptions,
    ) -> Result<Publisher, AmqpError> {
        Self::with_serializer(transport, options, Arc::new(JsonSerializer)).await
    }

    pub async fn with_serializer(
        transport: Arc<dyn Transport>,
        options: PublisherOptions,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Publisher, AmqpError> {
        if options.exchange != DEFAULT_EXCHANGE {
            ensure_exchange(
                transport.as_ref(),
                &ExchangeDefinition::new(&options.exchange).kind(options.kind),
            )
            .await?;
        }

        Ok(Publisher {
            transport,
            options,
            serializer,
            sent: AtomicU64::new(0),
        })
    }

    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    pub fn exchange(&self) -> &str {
        &self.options.exchange
    }

    /// Number of messages published so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, msg: &Message) -> Result<(), AmqpError> {
        self.publish_with(&self.options.topic, msg, Headers::new())
            .await
    }

    /// Publishes `msg` with an explicit routing key and extra headers.
    pub async fn publish_with(
        &self,
        routing_key: &str,
        msg: &Message,
        headers: Headers,
    ) -> Result<(), AmqpError> {
        let encoded = self.serializer.encode(msg)?;

        let mut props = MessageProperties::default()
            .with_content_type(&encoded.content_type)
            .with_content_encoding(&encoded.content_encoding)
            .with_message_id(&Uuid::new_v4().to_string())
            .with_timestamp(now_millis())
            .with_delivery_mode(DELIVERY_MODE_TRANSIENT)
            .with_headers(headers);
        otel::inject(&Context::current(), &mut props.headers);

        if let Err(err) = self
            .transport
            .publish(&self.options.exchange, routing_key, props, encoded.payload)
            .await
        {
            error!(error = err.to_string(), "error publishing message");
            return Err(err);
        }

        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(exchange = self.options.exchange, routing_key = routing_key, "message published");
        Ok(())
    }

    /// Publishes `msg` every `1 / hz` seconds until the channel closes.
    ///
    /// `hz == 0` publishes once. Negative or non-finite rates are rejected.
    pub async fn publish_loop(&self, msg: &Message, hz: f64) -> Result<(), AmqpError> {
        if !hz.is_finite() || hz < 0.0 {
            return Err(AmqpError::InvalidFrequency(hz.to_string()));
        }
        if hz == 0.0 {
            return self.publish(msg).await;
        }

        let mut ticker = interval(Duration::from_secs_f64(1.0 / hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.transport.is_open() {
                debug!(topic = self.options.topic, "publish loop stopped, channel closed");
                return Ok(());
            }
            self.publish(msg).await?;
        }
    }

    /// Returns false when the channel was already closed.
    pub async fn close(&self) -> Result<bool, AmqpError> {
        if !self.transport.is_open() {
            warn!(topic = self.options.topic, "channel was already closed");
            return Ok(false);
        }
        self.transport.close().await?;
        Ok(true)
    }
}
