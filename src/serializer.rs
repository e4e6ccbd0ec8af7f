// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! Maps the structured `Message` the patterns exchange to payload bytes tagged
//! with a content type and encoding, and back.

use crate::errors::AmqpError;
use serde_json::Value;
use tracing::{error, warn};

/// Content type of JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of plain text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Legacy spelling of the text content type still sent by older peers
pub const LEGACY_TEXT_CONTENT_TYPE: &str = "plain/text";
/// Content type of opaque binary payloads
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";
/// Encoding used when a message carries none
pub const DEFAULT_CONTENT_ENCODING: &str = "utf8";

/// Decode strategy selected by a message's content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Text,
    Raw,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => JSON_CONTENT_TYPE,
            ContentType::Text => TEXT_CONTENT_TYPE,
            ContentType::Raw => RAW_CONTENT_TYPE,
        }
    }

    /// Parses a content type header, `None` when it is unknown.
    pub fn parse(value: &str) -> Option<ContentType> {
        let mime = value.split(';').next().unwrap_or_default().trim();
        match mime {
            JSON_CONTENT_TYPE => Some(ContentType::Json),
            TEXT_CONTENT_TYPE | LEGACY_TEXT_CONTENT_TYPE => Some(ContentType::Text),
            RAW_CONTENT_TYPE => Some(ContentType::Raw),
            _ => None,
        }
    }
}

/// A message as seen by application code.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Json(Value),
    Text(String),
    Raw(Vec<u8>),
}

impl Message {
    pub fn content_type(&self) -> ContentType {
        match self {
            Message::Json(_) => ContentType::Json,
            Message::Text(_) => ContentType::Text,
            Message::Raw(_) => ContentType::Raw,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Message::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Json(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::Text(value.to_owned())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::Text(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::Raw(value)
    }
}

/// An encoded payload ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
}

/// Encodes messages to wire payloads and decodes them back.
pub trait Serializer: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Encoded, AmqpError>;

    /// Decodes `data` according to its content type.
    ///
    /// A missing or unknown content type falls back to JSON.
    fn decode(
        &self,
        data: &[u8],
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<Message, AmqpError>;
}

/// The default serializer: JSON for structured data, text and raw passthrough.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, msg: &Message) -> Result<Encoded, AmqpError> {
        let payload = match msg {
            Message::Json(value) => serde_json::to_vec(value).map_err(|err| {
                error!(error = err.to_string(), "failure to serialize json payload");
                AmqpError::SerializePayloadError(err.to_string())
            })?,
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Raw(bytes) => bytes.clone(),
        };

        Ok(Encoded {
            payload,
            content_type: msg.content_type().as_str().to_owned(),
            content_encoding: DEFAULT_CONTENT_ENCODING.to_owned(),
        })
    }

    fn decode(
        &self,
        data: &[u8],
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<Message, AmqpError> {
        let encoding = content_encoding.unwrap_or(DEFAULT_CONTENT_ENCODING);

        let kind = match content_type.and_then(ContentType::parse) {
            Some(kind) => kind,
            None => {
                warn!(
                    content_type = content_type.unwrap_or_default(),
                    "content-type was not set in headers or is invalid, decoding as json"
                );
                ContentType::Json
            }
        };

        match kind {
            ContentType::Json => serde_json::from_slice(data)
                .map(Message::Json)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
            ContentType::Text => decode_text(data, encoding).map(Message::Text),
            ContentType::Raw => Ok(Message::Raw(data.to_vec())),
        }
    }
}

fn decode_text(data: &[u8], encoding: &str) -> Result<String, AmqpError> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" | "ascii" | "us-ascii" => String::from_utf8(data.to_vec())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
        other => Err(AmqpError::ParsePayloadError(format!(
            "unsupported content encoding {other}"
        ))),
    }
}

/// Decodes with `serializer`, passing the payload through as raw bytes when that fails.
pub(crate) fn decode_or_raw(
    serializer: &dyn Serializer,
    data: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) -> Message {
    match serializer.decode(data, content_type, content_encoding) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = err.to_string(), "could not deserialize data, passing raw payload");
            Message::Raw(data.to_vec())
        }
    }
}
