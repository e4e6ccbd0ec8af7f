// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Exposes an `RpcHandler` as a named rpc endpoint. The server owns a queue
//! named after the rpc, consumes it with a prefetch of one, and publishes each
//! handler result to the caller's reply-to address before acknowledging the
//! request. Handler errors and panics are turned into `501` response bodies so
//! the consume loop never stops because of application code.
//!
//! State machine: `Idle -> Consuming -> Closed`. `run` drives the loop on the
//! caller's task, `run_threaded` on a spawned one; either can start it once.

use crate::{
    consumer::{ConsumeControl, ConsumerState},
    envelope::{now_millis, Delivery, MessageMetadata, MessageProperties, DELIVERY_MODE_TRANSIENT},
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    handler::RpcHandler,
    otel,
    queue::QueueDefinition,
    serializer::{decode_or_raw, JsonSerializer, Message, Serializer},
    transport::{ConsumeOptions, Transport},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::json;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Status carried by error responses the server synthesizes.
pub const NOT_IMPLEMENTED_STATUS: u16 = 501;

/// Response sent when no handler is registered.
pub fn not_implemented() -> Message {
    Message::Json(json!({
        "error": "Not Implemented",
        "status": NOT_IMPLEMENTED_STATUS,
    }))
}

/// Response sent when the handler fails.
pub fn internal_error(reason: &str) -> Message {
    Message::Json(json!({
        "status": NOT_IMPLEMENTED_STATUS,
        "error": format!("Internal server error: {reason}"),
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcServerOptions {
    pub(crate) name: String,
    pub(crate) exchange: String,
    pub(crate) strict: bool,
    pub(crate) prefetch: u16,
}

impl RpcServerOptions {
    /// Strict options for the rpc `name`, replying through the default exchange.
    pub fn new(name: &str) -> Self {
        RpcServerOptions {
            name: name.to_owned(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            strict: true,
            prefetch: 1,
        }
    }

    /// Exchange responses are published to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Fail construction when another consumer already serves the rpc queue.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

pub struct RpcServer {
    transport: Arc<dyn Transport>,
    options: RpcServerOptions,
    queue: String,
    handler: Option<Arc<dyn RpcHandler>>,
    serializer: Arc<dyn Serializer>,
    control: ConsumeControl,
}

impl RpcServer {
    /// Declares the rpc queue and limits the channel to one unacknowledged request.
    pub async fn new(
        transport: Arc<dyn Transport>,
        options: RpcServerOptions,
        handler: Option<Arc<dyn RpcHandler>>,
    ) -> Result<RpcServer, AmqpError> {
        Self::with_serializer(transport, options, handler, Arc::new(JsonSerializer)).await
    }

    pub async fn with_serializer(
        transport: Arc<dyn Transport>,
        options: RpcServerOptions,
        handler: Option<Arc<dyn RpcHandler>>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<RpcServer, AmqpError> {
        if let Some(info) = transport.queue_info(&options.name).await? {
            if info.consumer_count > 0 {
                if options.strict {
                    error!(rpc = options.name, "rpc already registered on broker");
                    return Err(AmqpError::RpcAlreadyRegistered(options.name.clone()));
                }
                warn!(
                    rpc = options.name,
                    consumers = info.consumer_count,
                    "sharing rpc queue with other servers"
                );
            }
        }

        let queue = transport
            .declare_queue(&QueueDefinition::new(&options.name))
            .await?;
        transport.qos(options.prefetch).await?;

        Ok(RpcServer {
            transport,
            options,
            queue,
            handler,
            serializer,
            control: ConsumeControl::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        self.control.state()
    }

    /// Consumes requests on the calling task until the server is closed.
    pub async fn run(&self) -> Result<(), AmqpError> {
        self.control.start()?;
        self.consume_loop().await
    }

    /// Consumes requests on a spawned task.
    pub fn run_threaded(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<(), AmqpError>>, AmqpError> {
        self.control.start()?;
        let server = Arc::clone(self);
        Ok(tokio::spawn(async move { server.consume_loop().await }))
    }

    /// Stops consuming, deletes the rpc queue and closes the channel.
    ///
    /// Returns false, without touching the broker, when already closed.
    pub async fn close(&self) -> Result<bool, AmqpError> {
        let Some(tag) = self.control.shutdown(self.transport.is_open()) else {
            warn!(rpc = self.options.name, "channel was already closed");
            return Ok(false);
        };

        if let Some(tag) = tag {
            if let Err(err) = self.transport.cancel(&tag).await {
                warn!(error = err.to_string(), "failure to cancel rpc consumer");
            }
        }

        self.transport.delete_queue(&self.queue).await?;
        self.transport.close().await?;
        info!(rpc = self.options.name, "rpc server closed");

        Ok(true)
    }

    /// Alias of [`RpcServer::close`].
    pub async fn stop(&self) -> Result<bool, AmqpError> {
        self.close().await
    }

    async fn consume_loop(&self) -> Result<(), AmqpError> {
        info!("rpc endpoint ready: {}", self.options.name);

        let tracer = global::tracer("amqp rpc server");
        let tracer = &tracer;
        self.control
            .drive(
                self.transport.as_ref(),
                &self.queue,
                ConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                },
                |delivery| self.on_request(tracer, delivery),
            )
            .await
    }

    async fn on_request(&self, tracer: &BoxedTracer, delivery: Delivery) -> Result<(), AmqpError> {
        let meta = MessageMetadata::from(&delivery);
        let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &self.options.name);

        let msg = decode_or_raw(
            self.serializer.as_ref(),
            &delivery.data,
            meta.content_type.as_deref(),
            meta.content_encoding.as_deref(),
        );
        debug!(
            rpc = self.options.name,
            correlation_id = meta.correlation_id.as_deref().unwrap_or_default(),
            "received rpc request"
        );

        let response = match self.respond(msg, meta.clone()).await {
            Ok(response) => {
                span.set_status(Status::Ok);
                response
            }
            Err(reason) => {
                span.set_status(Status::Error {
                    description: Cow::from(reason.clone()),
                });
                internal_error(&reason)
            }
        };

        let encoded = match self.serializer.encode(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = err.to_string(), "could not serialize rpc response");
                self.serializer.encode(&internal_error(&err.to_string()))?
            }
        };

        let published = match meta.reply_to.as_deref() {
            Some(reply_to) => {
                let mut props = MessageProperties::default()
                    .with_content_type(&encoded.content_type)
                    .with_content_encoding(&encoded.content_encoding)
                    .with_timestamp(now_millis())
                    .with_delivery_mode(DELIVERY_MODE_TRANSIENT);
                if let Some(id) = &meta.correlation_id {
                    props = props.with_correlation_id(id);
                }

                self.transport
                    .publish(&self.options.exchange, reply_to, props, encoded.payload)
                    .await
            }
            None => {
                warn!(rpc = self.options.name, "request without reply-to, response dropped");
                Ok(())
            }
        };
        if let Err(err) = &published {
            error!(error = err.to_string(), "failure to publish rpc response");
        }

        let acked = self.transport.ack(delivery.delivery_tag).await;
        published.and(acked)
    }

    async fn respond(&self, msg: Message, meta: MessageMetadata) -> Result<Message, String> {
        let Some(handler) = &self.handler else {
            return Ok(not_implemented());
        };

        match AssertUnwindSafe(handler.exec(msg, meta)).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                warn!(error = err.to_string(), "rpc handler failed");
                Err(err.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic);
                error!(error = reason, "rpc handler panicked");
                Err(reason)
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_owned()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "handler panicked".to_owned()
    }
}
