// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Request/response calls over AMQP direct reply-to. The client registers one
//! auto-acknowledged consumer on `amq.rabbitmq.reply-to` for its whole life and
//! a background task hands every reply to the [`CorrelationTracker`], which
//! wakes the call waiting on that correlation id.

use crate::{
    correlation::CorrelationTracker,
    envelope::{now_millis, MessageMetadata, MessageProperties, DELIVERY_MODE_TRANSIENT},
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    otel,
    serializer::{decode_or_raw, JsonSerializer, Message, Serializer},
    transport::{ConsumeOptions, DeliveryStream, Transport, DIRECT_REPLY_TO},
};
use futures_util::StreamExt;
use opentelemetry::Context;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex as CallLock,
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, warn};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Error text of the response returned when a call times out.
pub const RPC_TIMEOUT_ERROR: &str = "RPC Response timeout";

pub fn timeout_response() -> Message {
    Message::Json(json!({ "error": RPC_TIMEOUT_ERROR }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientOptions {
    pub(crate) name: String,
    pub(crate) exchange: String,
    pub(crate) use_corr_id: bool,
}

impl RpcClientOptions {
    pub fn new(name: &str) -> Self {
        RpcClientOptions {
            name: name.to_owned(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            use_corr_id: true,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Disables correlation ids. Calls are then serialized and any reply
    /// arriving on the reply-to address answers the pending call.
    pub fn use_corr_id(mut self, enabled: bool) -> Self {
        self.use_corr_id = enabled;
        self
    }
}

#[derive(Debug, Default)]
struct CallDelays {
    last: Duration,
    mean_secs: f64,
    calls: u32,
}

impl CallDelays {
    fn record(&mut self, delay: Duration) {
        self.calls = self.calls.saturating_add(1);
        self.last = delay;
        self.mean_secs += (delay.as_secs_f64() - self.mean_secs) / f64::from(self.calls);
    }
}

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    options: RpcClientOptions,
    serializer: Arc<dyn Serializer>,
    tracker: Arc<CorrelationTracker>,
    call_lock: CallLock<()>,
    delays: Mutex<CallDelays>,
    consumer_tag: String,
    replies: JoinHandle<()>,
    closed: AtomicBool,
}

impl RpcClient {
    pub async fn new(
        transport: Arc<dyn Transport>,
        options: RpcClientOptions,
    ) -> Result<RpcClient, AmqpError> {
        Self::with_serializer(transport, options, Arc::new(JsonSerializer)).await
    }

    pub async fn with_serializer(
        transport: Arc<dyn Transport>,
        options: RpcClientOptions,
        serializer: Arc<dyn Serializer>,
    ) -> Result<RpcClient, AmqpError> {
        let consumer = transport
            .consume(
                DIRECT_REPLY_TO,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: false,
                },
            )
            .await?;

        let tracker = Arc::new(CorrelationTracker::new(options.use_corr_id));
        let replies = tokio::spawn(receive_replies(
            consumer.deliveries,
            Arc::clone(&tracker),
            Arc::clone(&serializer),
        ));
        debug!(rpc = options.name, "rpc client listening for replies");

        Ok(RpcClient {
            transport,
            options,
            serializer,
            tracker,
            call_lock: CallLock::new(()),
            delays: Mutex::new(CallDelays::default()),
            consumer_tag: consumer.tag,
            replies,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Sends `msg` and waits up to `timeout` for the response.
    ///
    /// A missed deadline is not an error: the call resolves to
    /// `{"error": "RPC Response timeout"}`. Publish failures are returned.
    /// A `timeout` beyond the clock's range waits without a deadline.
    pub async fn call(&self, msg: &Message, timeout: Duration) -> Result<Message, AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelClosed);
        }

        let _serial = if self.tracker.is_checked() {
            None
        } else {
            Some(self.call_lock.lock().await)
        };

        let started = Instant::now();
        let id = self.tracker.next_id();
        let encoded = self.serializer.encode(msg)?;

        let mut props = MessageProperties::default()
            .with_content_type(&encoded.content_type)
            .with_content_encoding(&encoded.content_encoding)
            .with_reply_to(DIRECT_REPLY_TO)
            .with_timestamp(now_millis())
            .with_delivery_mode(DELIVERY_MODE_TRANSIENT);
        if let Some(id) = &id {
            props = props.with_correlation_id(id);
        }
        otel::inject(&Context::current(), &mut props.headers);

        let reply = self.tracker.register(id.as_deref(), timeout);
        let _pending = PendingSlot {
            tracker: &self.tracker,
            id: id.as_deref(),
        };

        if let Err(err) = self
            .transport
            .publish(&self.options.exchange, &self.options.name, props, encoded.payload)
            .await
        {
            error!(
                rpc = self.options.name,
                error = err.to_string(),
                "failure to publish rpc request"
            );
            return Err(err);
        }

        // A timeout too large to add to `started` means no deadline at all.
        let outcome = match started.checked_add(timeout) {
            Some(deadline) => timeout_at(deadline, reply).await,
            None => Ok(reply.await),
        };
        self.lock_delays().record(started.elapsed());

        match outcome {
            Ok(Ok((response, _))) => Ok(response),
            Ok(Err(_)) if self.closed.load(Ordering::Acquire) => Err(AmqpError::ChannelClosed),
            Ok(Err(_)) => {
                warn!(rpc = self.options.name, "rpc call superseded before its response arrived");
                Ok(timeout_response())
            }
            Err(_) => {
                warn!(
                    rpc = self.options.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "rpc response timeout"
                );
                Ok(timeout_response())
            }
        }
    }

    /// Round-trip time of the last call.
    pub fn delay(&self) -> Duration {
        self.lock_delays().last
    }

    /// Running mean of round-trip times over every call made so far.
    pub fn mean_delay(&self) -> Duration {
        Duration::from_secs_f64(self.lock_delays().mean_secs)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Cancels the reply consumer and closes the channel.
    ///
    /// Returns false when the client was already closed.
    pub async fn close(&self) -> Result<bool, AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.transport.is_open() {
            warn!(rpc = self.options.name, "channel was already closed");
            self.replies.abort();
            return Ok(false);
        }

        if let Err(err) = self.transport.cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), "failure to cancel reply consumer");
        }
        self.replies.abort();
        self.transport.close().await?;

        Ok(true)
    }

    fn lock_delays(&self) -> MutexGuard<'_, CallDelays> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the response slot of a call that returns, fails or is cancelled.
struct PendingSlot<'a> {
    tracker: &'a CorrelationTracker,
    id: Option<&'a str>,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.tracker.forget(self.id);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.replies.abort();
    }
}

async fn receive_replies(
    mut deliveries: DeliveryStream,
    tracker: Arc<CorrelationTracker>,
    serializer: Arc<dyn Serializer>,
) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "errors consume rpc reply");
                continue;
            }
        };

        let meta = MessageMetadata::from(&delivery);
        let msg = decode_or_raw(
            serializer.as_ref(),
            &delivery.data,
            meta.content_type.as_deref(),
            meta.content_encoding.as_deref(),
        );
        let id = meta.correlation_id.clone();
        tracker.resolve(id.as_deref(), (msg, meta));
    }

    debug!("reply consumer stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::Delivery,
        transport::{ConsumerHandle, MockTransport},
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use tokio::sync::mpsc;

    fn reply_transport(replies: mpsc::UnboundedReceiver<Delivery>) -> MockTransport {
        let mut replies = Some(replies);
        let mut transport = MockTransport::new();
        transport
            .expect_consume()
            .with(
                eq(DIRECT_REPLY_TO),
                eq(ConsumeOptions {
                    no_ack: true,
                    exclusive: false,
                }),
            )
            .times(1)
            .returning(move |_, _| {
                let rx = replies.take().unwrap();
                let deliveries = stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|delivery| (Ok(delivery), rx))
                });
                Ok(ConsumerHandle {
                    tag: "reply-ctag".to_owned(),
                    deliveries: deliveries.boxed(),
                })
            });
        transport
    }

    fn reply(correlation_id: &str, body: &str) -> Delivery {
        Delivery {
            properties: MessageProperties::default()
                .with_content_type("application/json")
                .with_correlation_id(correlation_id),
            data: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_carries_reply_to_and_correlation_id() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport
            .expect_publish()
            .withf(|exchange, key, props, payload| {
                exchange.is_empty()
                    && key == "rpc.mult"
                    && props.reply_to.as_deref() == Some(DIRECT_REPLY_TO)
                    && props.delivery_mode == Some(DELIVERY_MODE_TRANSIENT)
                    && props.timestamp.is_some()
                    && payload.as_slice() == br#"{"a":4,"b":13}"#
            })
            .times(1)
            .returning(move |_, _, props, _| {
                let id = props.correlation_id.unwrap();
                tx.send(reply("stale", "0")).unwrap();
                tx.send(reply(&id, "52")).unwrap();
                Ok(())
            });

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        let response = client
            .call(&Message::Json(json!({"a": 4, "b": 13})), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(response, Message::Json(json!(52)));
        assert_eq!(client.in_flight(), 0);
        assert!(client.delay() <= client.mean_delay() + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn missing_response_times_out_with_sentinel() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_publish().returning(|_, _, _, _| Ok(()));

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.none"))
            .await
            .unwrap();

        let started = Instant::now();
        let response = client
            .call(&Message::Text("ping".into()), Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(response, timeout_response());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn publish_failure_is_returned() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        let result = client.call(&Message::Json(json!({})), DEFAULT_RPC_TIMEOUT).await;

        assert_eq!(result, Err(AmqpError::PublishingError));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn uncorrelated_client_takes_any_reply() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport
            .expect_publish()
            .withf(|_, _, props, _| props.correlation_id.is_none())
            .returning(move |_, _, _, _| {
                tx.send(reply("anything", r#""pong""#)).unwrap();
                Ok(())
            });

        let client = RpcClient::new(
            Arc::new(transport),
            RpcClientOptions::new("rpc.ping").use_corr_id(false),
        )
        .await
        .unwrap();

        let response = client
            .call(&Message::Text("ping".into()), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(response, Message::Json(json!("pong")));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_is_open().return_const(true);
        transport
            .expect_cancel()
            .with(eq("reply-ctag"))
            .times(1)
            .returning(|_| Ok(()));
        transport.expect_close().times(1).returning(|| Ok(()));

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        assert_eq!(client.close().await, Ok(true));
        assert_eq!(client.close().await, Ok(false));
        assert_eq!(
            client.call(&Message::Json(json!({})), DEFAULT_RPC_TIMEOUT).await,
            Err(AmqpError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_the_reply() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_publish().returning(move |_, _, props, _| {
            tx.send(reply(&props.correlation_id.unwrap(), "52")).unwrap();
            Ok(())
        });

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        let response = client
            .call(&Message::Json(json!({"a": 4, "b": 13})), Duration::MAX)
            .await
            .unwrap();

        assert_eq!(response, Message::Json(json!(52)));
    }

    #[tokio::test]
    async fn cancelled_unbounded_call_releases_its_slot() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_publish().returning(|_, _, _, _| Ok(()));

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.none"))
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            client.call(&Message::Text("x".into()), Duration::MAX),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn undecodable_reply_is_returned_raw() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_publish().returning(move |_, _, props, _| {
            tx.send(reply(&props.correlation_id.unwrap(), "not json {"))
                .unwrap();
            Ok(())
        });

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        let response = client
            .call(&Message::Json(json!({"a": 1})), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(response, Message::Raw(b"not json {".to_vec()));
    }

    #[tokio::test]
    async fn close_on_a_closed_channel_stops_the_reply_task() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = reply_transport(rx);
        transport.expect_is_open().return_const(false);
        transport.expect_cancel().never();
        transport.expect_close().never();

        let client = RpcClient::new(Arc::new(transport), RpcClientOptions::new("rpc.mult"))
            .await
            .unwrap();

        assert_eq!(client.close().await, Ok(false));
        for _ in 0..100 {
            if client.replies.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(client.replies.is_finished());
    }

    #[test]
    fn mean_delay_is_a_running_mean() {
        let mut delays = CallDelays::default();
        delays.record(Duration::from_millis(10));
        delays.record(Duration::from_millis(30));

        assert_eq!(delays.last, Duration::from_millis(30));
        assert!((delays.mean_secs - 0.020).abs() < 1e-9);
    }
}
