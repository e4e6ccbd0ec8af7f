// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Helpers
//!
//! Declaration steps shared by the components: the existence-checked exchange
//! declaration used on shared exchanges, the bounded subscription queue, and the
//! translation of queue definitions into broker arguments.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::debug;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify the overflow behaviour
pub const AMQP_HEADERS_OVERFLOW: &str = "x-overflow";
/// Constant for the argument used to specify the idle queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Builds the `x-*` queue arguments for a queue definition.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut queue_args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(overflow) = def.overflow {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_OVERFLOW),
            AMQPValue::LongString(LongString::from(overflow.as_str())),
        );
    }

    if let Some(expires) = def.expires {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongInt(LongInt::from(expires)),
        );
    }

    FieldTable::from(queue_args)
}

/// Declares the exchange unless it already exists.
///
/// Redeclaring a shared exchange with different flags is a channel error on
/// the broker, so the existence check comes first. Returns whether a
/// declaration was issued.
pub async fn ensure_exchange(
    transport: &dyn Transport,
    def: &ExchangeDefinition,
) -> Result<bool, AmqpError> {
    if transport.exchange_exists(def.name()).await? {
        debug!("exchange: {} already exists", def.name());
        return Ok(false);
    }

    transport.declare_exchange(def).await?;
    debug!("exchange: {} was created", def.name());
    Ok(true)
}

/// Declares `def` and binds it to `exchange` with `routing_key`, returning the queue name.
pub async fn declare_bound_queue(
    transport: &dyn Transport,
    def: &QueueDefinition,
    exchange: &str,
    routing_key: &str,
) -> Result<String, AmqpError> {
    let queue = transport.declare_queue(def).await?;

    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue, exchange, routing_key
    );
    transport
        .bind_queue(
            &QueueBinding::new(&queue)
                .exchange(exchange)
                .routing_key(routing_key),
        )
        .await?;

    Ok(queue)
}
