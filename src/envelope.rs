// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Wire-level message properties and deliveries as seen by the patterns. The
//! transport implementations translate their client library's property and
//! delivery types into these.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

/// Header set by the broker's message timestamp plugin on receipt.
pub const HEADER_BROKER_TIMESTAMP: &str = "timestamp_in_ms";

/// Delivery mode of transient messages.
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    LongString(String),
    LongLongInt(i64),
    Boolean(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::LongString(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::LongLongInt(value) => Some(*value),
            HeaderValue::LongString(value) => value.parse().ok(),
            HeaderValue::Boolean(_) => None,
        }
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Producer-side send time in milliseconds since epoch.
    pub timestamp: Option<u64>,
    pub delivery_mode: Option<u8>,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn with_content_type(mut self, value: &str) -> Self {
        self.content_type = Some(value.to_owned());
        self
    }

    pub fn with_content_encoding(mut self, value: &str) -> Self {
        self.content_encoding = Some(value.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, value: &str) -> Self {
        self.correlation_id = Some(value.to_owned());
        self
    }

    pub fn with_reply_to(mut self, value: &str) -> Self {
        self.reply_to = Some(value.to_owned());
        self
    }

    pub fn with_message_id(mut self, value: &str) -> Self {
        self.message_id = Some(value.to_owned());
        self
    }

    pub fn with_timestamp(mut self, value: u64) -> Self {
        self.timestamp = Some(value);
        self
    }

    pub fn with_delivery_mode(mut self, value: u8) -> Self {
        self.delivery_mode = Some(value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// A message handed out by a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Transport handle used to acknowledge this delivery exactly once.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// Metadata passed to application callbacks next to the decoded message.
///
/// The two timestamps let callers compute end-to-end latency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub timestamp_broker: Option<i64>,
    pub timestamp_producer: Option<u64>,
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
}

impl MessageMetadata {
    /// Milliseconds between the producer timestamp and `now_ms`.
    pub fn latency_ms(&self, now_ms: u64) -> Option<u64> {
        self.timestamp_producer
            .map(|sent| now_ms.saturating_sub(sent))
    }
}

impl From<&Delivery> for MessageMetadata {
    fn from(delivery: &Delivery) -> Self {
        let props = &delivery.properties;
        MessageMetadata {
            content_type: props.content_type.clone(),
            content_encoding: props.content_encoding.clone(),
            timestamp_broker: props
                .headers
                .get(HEADER_BROKER_TIMESTAMP)
                .and_then(HeaderValue::as_i64),
            timestamp_producer: props.timestamp,
            delivery_mode: props.delivery_mode,
            correlation_id: props.correlation_id.clone(),
            reply_to: props.reply_to.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
        }
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
