// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining queues and their bindings. Queue
//! definitions carry the dead-letter arguments used to build the delayed-retry
//! ring: a rejected message leaves its queue for the configured dead-letter
//! exchange, and a dead-letter queue with a TTL sends it back once it expires.

use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};

/// Queue argument naming the exchange rejected or expired messages are sent to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are never exclusive nor auto-deleted: the pipeline relies on them
/// outliving any single connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i64>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets whether the queue survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Combined with [`QueueDefinition::dead_letter`], expired messages are
    /// re-routed instead of being dropped.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes messages rejected without requeue (or expired) from this queue to
    /// `exchange` using `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds the `x-` arguments sent with the queue declaration.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(LongLongInt::from(ttl)),
            );
        }

        args
    }
}

/// Binds a queue to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qb> {
    pub(crate) queue_name: &'qb str,
    pub(crate) exchange_name: &'qb str,
    pub(crate) routing_key: &'qb str,
}

impl<'qb> QueueBinding<'qb> {
    /// Starts a binding for `queue` on the default exchange with an empty key.
    pub fn new(queue: &'qb str) -> QueueBinding<'qb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    pub fn exchange(self, exchange: &'qb str) -> Self {
        QueueBinding {
            exchange_name: exchange,
            ..self
        }
    }

    pub fn routing_key(self, routing_key: &'qb str) -> Self {
        QueueBinding {
            routing_key,
            ..self
        }
    }
}
