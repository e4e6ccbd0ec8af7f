// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error types shared by every messaging pattern in the
//! crate. `AmqpError` covers transport, topology and payload failures that are
//! propagated to callers. `HandlerError` is what application handlers return; it
//! never escapes the consume loops, it is turned into a response or a log line.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Decode and handler failures are recovered locally by the components, so the
/// variants that reach application code are mostly construction-time conflicts
/// and transport failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or incomplete configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel backing a component was already closed
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error encoding a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Another server already consumes from the rpc queue
    #[error("rpc `{0}` already registered on broker")]
    RpcAlreadyRegistered(String),

    /// The consume loop of a component was already started
    #[error("consumer is already running")]
    AlreadyConsuming,

    /// Publishing frequency outside of `[0, inf)`
    #[error("invalid publishing frequency `{0}`")]
    InvalidFrequency(String),
}

/// Error returned by application handlers.
///
/// The rpc server converts it into a `501` response body, the subscriber logs it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

impl From<AmqpError> for HandlerError {
    fn from(value: AmqpError) -> Self {
        HandlerError(value.to_string())
    }
}
