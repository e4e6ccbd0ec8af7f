// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchange types and the builder used by publishers, subscribers and the rpc
//! server to describe the exchange they route through.

use crate::errors::AmqpError;

/// Name of the broker's default (nameless) exchange.
pub const DEFAULT_EXCHANGE: &str = "";
/// Pre-declared topic exchange used by the pub/sub pattern.
pub const TOPIC_EXCHANGE: &str = "amq.topic";
/// Exchange RabbitMQ publishes its internal events to.
pub const RABBITMQ_EVENT_EXCHANGE: &str = "amq.rabbitmq.event";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Default: the nameless exchange, routes to the queue named by the routing key
/// - Direct: routes on an exact routing key match
/// - Fanout: broadcasts to all bound queues
/// - Topic: routes on wildcard pattern match (`*` one word, `#` zero or more)
/// - Headers: routes on header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Default,
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Default => "",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    /// Converts the internal ExchangeKind to lapin's ExchangeKind.
    ///
    /// The default exchange always exists and can't be declared.
    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::Default => Err(AmqpError::DeclareExchangeError(
                DEFAULT_EXCHANGE.to_owned(),
            )),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            internal: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_exchange_cannot_be_declared() {
        let kind: Result<lapin::ExchangeKind, AmqpError> = ExchangeKind::Default.try_into();
        assert_eq!(kind, Err(AmqpError::DeclareExchangeError(String::new())));
    }

    #[test]
    fn builder_sets_topic_and_durability() {
        let def = ExchangeDefinition::new("events").topic().durable();
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.durable);
        assert!(!def.delete);
    }
}
