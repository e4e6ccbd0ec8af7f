// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue descriptors owned by the rpc server and the subscriber. Both declare
//! their queue once at construction and delete it on close, so the defaults are
//! non-durable and auto-delete.

/// Behaviour of a bounded queue once `max_length` is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Drop the oldest message to make room for the new one.
    #[default]
    DropHead,
    /// Refuse the incoming message.
    RejectPublish,
    /// Refuse the incoming message and dead-letter it.
    RejectPublishDlx,
}

impl Overflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Overflow::DropHead => "drop-head",
            Overflow::RejectPublish => "reject-publish",
            Overflow::RejectPublishDlx => "reject-publish-dlx",
        }
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// An empty name asks the broker to generate one (`amq.gen-...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) overflow: Option<Overflow>,
    pub(crate) expires: Option<i32>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition::new("")
    }
}

impl QueueDefinition {
    /// Creates a new non-durable, auto-delete queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: true,
            exclusive: false,
            passive: false,
            ttl: None,
            max_length: None,
            overflow: None,
            expires: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Keeps the queue when its last consumer goes away.
    pub fn keep(mut self) -> Self {
        self.delete = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks the queue exists, never creates it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Per-queue message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets what happens once `max_length` is reached.
    pub fn overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = Some(overflow);
        self
    }

    /// Deletes the queue after it has been unused for `expires` milliseconds.
    pub fn expires(mut self, expires: i32) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key default to empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding, topic wildcards allowed.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
