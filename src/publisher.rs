// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes [`Message`]s as persistent deliveries. Publishing is
//! fire-and-forget: `enqueue` returns once the client has handed the frame to
//! the broker, without waiting for a confirmation, and unroutable messages are
//! silently dropped (`mandatory = false`).

use crate::{
    channel::AmqpChannel, connection::BrokerConnection, errors::AmqpError, message::Message, otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// AMQP delivery mode for messages the broker writes to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes messages through the shared [`BrokerConnection`].
pub struct RabbitMQPublisher {
    connection: Arc<BrokerConnection>,
}

impl RabbitMQPublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { connection })
    }

    /// Publishes the message, opening the connection first if needed.
    pub async fn enqueue(&self, message: Message) -> Result<(), AmqpError> {
        let channel = self.connection.initialize().await?;
        publish(channel.as_ref(), &Context::current(), message).await
    }
}

pub(crate) async fn publish(
    channel: &dyn AmqpChannel,
    ctx: &Context,
    message: Message,
) -> Result<(), AmqpError> {
    let mut headers = message.header_entries();
    otel::inject(ctx, &mut headers);

    let properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    debug!(
        exchange = message.exchange,
        routing_key = message.routing_key,
        content = message.content,
        "pushing message"
    );

    channel
        .basic_publish(
            &message.exchange,
            &message.routing_key,
            message.content_before_send(),
            properties,
        )
        .await?;

    debug!("message was successfully pushed");

    Ok(())
}
