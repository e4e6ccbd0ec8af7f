// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The channel-level contract the messaging patterns are written against. One
//! `Transport` value is one AMQP channel: declarations, publishes, consumers and
//! acknowledgements all go through it. A `Connector` hands out channels that
//! share one underlying connection, so components built on the same connector
//! never drive a channel concurrently.
//!
//! Concrete implementations live in [`amqp`] (lapin) and [`memory`] (in-process
//! broker for tests and local runs).

pub mod amqp;
pub mod memory;

use crate::{
    envelope::{Delivery, MessageProperties},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Broker pseudo-queue used for direct reply-to rpc responses.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Stream of deliveries surfaced by a consumer, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Options applied when registering a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
    pub exclusive: bool,
}

/// A registered consumer.
pub struct ConsumerHandle {
    pub tag: String,
    pub deliveries: DeliveryStream,
}

/// Broker-side state of an existing queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange, failing on a conflicting redeclaration.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError>;

    /// Declares a queue and returns its name, which the broker picks when empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Returns `None` when no queue with that name exists.
    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>, AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Vec<u8>,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Stops a consumer; its delivery stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// Opens channels on a shared connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn channel(&self) -> Result<Arc<dyn Transport>, AmqpError>;
}
