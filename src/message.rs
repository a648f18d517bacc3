// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbound Messages
//!
//! A [`Message`] is built by a producer and handed by value to the publisher,
//! which consumes it. The content stays a `String` until the publisher encodes
//! it right before sending.

use lapin::types::{AMQPValue, LongInt, LongLongInt, LongString, ShortString};
use std::collections::{BTreeMap, HashMap};

/// Header value attached to an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Long(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::Long(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// A message to publish to `exchange` with `routing_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub content: String,
    pub headers: Option<HashMap<String, HeaderValue>>,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, content: impl Into<String>) -> Message {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content: content.into(),
            headers: None,
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.into());
        self
    }

    /// UTF-8 bytes of the content. Only the publisher calls this, at send time.
    pub(crate) fn content_before_send(&self) -> Vec<u8> {
        self.content.as_bytes().to_vec()
    }

    /// Converts the declared headers into AMQP header entries.
    pub(crate) fn header_entries(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.headers
            .iter()
            .flatten()
            .map(|(key, value)| (ShortString::from(key.as_str()), AMQPValue::from(value.clone())))
            .collect()
    }
}
