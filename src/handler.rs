// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Handlers
//!
//! Callback traits invoked by the consume loops, once per delivery, on the task
//! driving the loop. Plain closures implement them.

use crate::{envelope::MessageMetadata, errors::HandlerError, serializer::Message};
use async_trait::async_trait;

/// Serves rpc requests. The returned message is the response body.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn exec(&self, msg: Message, meta: MessageMetadata) -> Result<Message, HandlerError>;
}

#[async_trait]
impl<F> RpcHandler for F
where
    F: Fn(Message, MessageMetadata) -> Result<Message, HandlerError> + Send + Sync,
{
    async fn exec(&self, msg: Message, meta: MessageMetadata) -> Result<Message, HandlerError> {
        (self)(msg, meta)
    }
}

/// Receives messages delivered to a subscription.
#[async_trait]
pub trait SubscriberHandler: Send + Sync {
    async fn on_message(&self, msg: Message, meta: MessageMetadata) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> SubscriberHandler for F
where
    F: Fn(Message, MessageMetadata) -> Result<(), HandlerError> + Send + Sync,
{
    async fn on_message(&self, msg: Message, meta: MessageMetadata) -> Result<(), HandlerError> {
        (self)(msg, meta)
    }
}
