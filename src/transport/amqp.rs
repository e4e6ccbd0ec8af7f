// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! `Transport` backed by a lapin channel. Existence checks use passive
//! declarations on a short-lived side channel, since a failed passive
//! declaration closes the channel it was issued on.

use super::{ConsumeOptions, ConsumerHandle, Connector, QueueInfo, Transport};
use crate::{
    configs::AmqpConfigs,
    envelope::{Delivery, HeaderValue, Headers, MessageProperties},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::queue_arguments,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// A lapin connection handing out `AmqpTransport` channels.
pub struct AmqpConnection {
    conn: Arc<Connection>,
}

impl AmqpConnection {
    /// Establishes a connection to RabbitMQ using the given configs.
    pub async fn connect(cfg: &AmqpConfigs) -> Result<AmqpConnection, AmqpError> {
        debug!(
            "connecting to amqp broker @ [{}:{}, vhost={}]...",
            cfg.host, cfg.port, cfg.vhost
        );
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));

        let conn = match Connection::connect_uri(cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }?;
        debug!("amqp connected");

        Ok(AmqpConnection {
            conn: Arc::new(conn),
        })
    }

    /// Creates a new channel on this connection.
    pub async fn open_channel(&self) -> Result<AmqpTransport, AmqpError> {
        let channel = create_channel(&self.conn).await?;
        Ok(AmqpTransport {
            conn: self.conn.clone(),
            channel: Arc::new(channel),
        })
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(REPLY_SUCCESS, "bye").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError
        })
    }
}

#[async_trait]
impl Connector for AmqpConnection {
    async fn channel(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        Ok(Arc::new(self.open_channel().await?))
    }
}

async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

/// One lapin channel.
pub struct AmqpTransport {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpTransport {
    // Runs a passive declaration on a throwaway channel.
    async fn side_check<F, Fut, T>(&self, check: F) -> Result<Option<T>, AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = (Channel, lapin::Result<T>)>,
    {
        let side = create_channel(&self.conn).await?;
        let (side, result) = check(side).await;

        match result {
            Ok(found) => {
                if let Err(err) = side.close(REPLY_SUCCESS, "side check").await {
                    debug!(error = err.to_string(), "failure to close side channel");
                }
                Ok(Some(found))
            }
            // 404 closes the side channel on the broker
            Err(err) => {
                debug!(error = err.to_string(), "passive declaration failed");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);
        let kind: lapin::ExchangeKind = def.kind.try_into()?;

        match self
            .channel
            .exchange_declare(
                &def.name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let name = name.to_owned();
        let found = self
            .side_check(|side| async move {
                let result = side
                    .exchange_declare(
                        &name,
                        lapin::ExchangeKind::Topic,
                        ExchangeDeclareOptions {
                            passive: true,
                            ..ExchangeDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await;
                (side, result)
            })
            .await?;

        Ok(found.is_some())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>, AmqpError> {
        let name = name.to_owned();
        self.side_check(|side| async move {
            let result = side
                .queue_declare(
                    &name,
                    QueueDeclareOptions {
                        passive: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|queue| QueueInfo {
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                });
            (side, result)
        })
        .await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = name, "failure to delete queue");
                Err(AmqpError::DeleteQueueError(name.to_owned()))
            }
            Ok(_) => {
                debug!("queue: {} was deleted", name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Vec<u8>,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &payload,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let tag = format!("ctag-{}", Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries = consumer
            .map(|result| match result {
                Ok(delivery) => Ok(from_lapin_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed();

        Ok(ConsumerHandle { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::ConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn to_basic_properties(props: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(value) = props.content_type {
        basic = basic.with_content_type(ShortString::from(value));
    }
    if let Some(value) = props.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(value));
    }
    if let Some(value) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(value));
    }
    if let Some(value) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(value));
    }
    if let Some(value) = props.message_id {
        basic = basic.with_message_id(ShortString::from(value));
    }
    if let Some(value) = props.timestamp {
        basic = basic.with_timestamp(value);
    }
    if let Some(value) = props.delivery_mode {
        basic = basic.with_delivery_mode(value);
    }
    if !props.headers.is_empty() {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in props.headers {
            let amqp_value = match value {
                HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
                HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(v),
                HeaderValue::Boolean(v) => AMQPValue::Boolean(v),
            };
            btree.insert(ShortString::from(key), amqp_value);
        }
        basic = basic.with_headers(FieldTable::from(btree));
    }

    basic
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = Headers::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let Some(header) = from_amqp_value(value) {
                headers.insert(key.to_string(), header);
            }
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        content_encoding: props.content_encoding().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        timestamp: *props.timestamp(),
        delivery_mode: *props.delivery_mode(),
        headers,
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Boolean(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
        AMQPValue::Timestamp(v) => Some(HeaderValue::LongLongInt(*v as i64)),
        AMQPValue::ShortString(v) => Some(HeaderValue::LongString(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::LongString(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        data: delivery.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HEADER_BROKER_TIMESTAMP;

    #[test]
    fn properties_survive_lapin_conversion() {
        let props = MessageProperties::default()
            .with_content_type("application/json")
            .with_content_encoding("utf8")
            .with_correlation_id("c-1")
            .with_reply_to("amq.rabbitmq.reply-to")
            .with_timestamp(42)
            .with_header("agent", HeaderValue::LongString("cli".into()));

        let back = from_amqp_properties(&to_basic_properties(props.clone()));

        assert_eq!(back, props);
    }

    #[test]
    fn numeric_headers_widen_to_long_long() {
        assert_eq!(
            from_amqp_value(&AMQPValue::Timestamp(1_700_000_000_000)),
            Some(HeaderValue::LongLongInt(1_700_000_000_000))
        );
        assert_eq!(
            from_amqp_value(&AMQPValue::LongUInt(5)),
            Some(HeaderValue::LongLongInt(5))
        );
        assert_eq!(from_amqp_value(&AMQPValue::Void), None);

        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from(HEADER_BROKER_TIMESTAMP),
            AMQPValue::LongLongInt(9),
        );
        let props = BasicProperties::default().with_headers(FieldTable::from(table));
        assert_eq!(
            from_amqp_properties(&props).headers.get(HEADER_BROKER_TIMESTAMP),
            Some(&HeaderValue::LongLongInt(9))
        );
    }
}
