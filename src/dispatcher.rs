// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module registers typed callbacks on the consuming queue. [`dequeue`]
//! builds a [`DeliveryHandler`] bound to a cancellation signal, and
//! [`consume_blocking`] drives it over the broker's delivery stream until the
//! signal fires or the stream ends.
//!
//! Up to `prefetch` deliveries are handled at once. Once the signal fires, no
//! new delivery is pulled, in-flight ones run to completion and the consumer is
//! cancelled on the broker. Deliveries are settled on the channel they arrived
//! on; when that channel dies the stream ends and the host has to consume again
//! on the recovered connection.
//!
//! [`dequeue`]: RabbitMQDispatcher::dequeue
//! [`consume_blocking`]: RabbitMQDispatcher::consume_blocking

use crate::{
    connection::BrokerConnection,
    consumer::{callback, DeliveryHandler},
    errors::{AmqpError, HandlerError},
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumes the configured queue through the shared [`BrokerConnection`].
pub struct RabbitMQDispatcher {
    connection: Arc<BrokerConnection>,
}

impl RabbitMQDispatcher {
    pub fn new(connection: Arc<BrokerConnection>) -> RabbitMQDispatcher {
        RabbitMQDispatcher { connection }
    }

    /// Builds the handler that runs `callback` for every parsed delivery.
    ///
    /// Fails with [`AmqpError::Canceled`] if `token` already fired, otherwise
    /// makes sure the connection is open and the topology provisioned.
    pub async fn dequeue<T, F, Fut>(
        &self,
        token: CancellationToken,
        f: F,
    ) -> Result<DeliveryHandler<T>, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if token.is_cancelled() {
            return Err(AmqpError::Canceled);
        }

        self.connection.initialize().await?;

        Ok(DeliveryHandler::new(
            self.connection.configuration(),
            token,
            callback(f),
        ))
    }

    /// Subscribes `handler` to the consuming queue and processes deliveries
    /// until its cancellation signal fires.
    ///
    /// Fails with [`AmqpError::ConsumerError`] when the broker ends the stream
    /// first, typically because the channel was lost.
    pub async fn consume_blocking<T>(&self, handler: DeliveryHandler<T>) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let cfg = self.connection.configuration().clone();
        let channel = self.connection.initialize().await?;

        channel.basic_qos(cfg.prefetch).await?;

        let consumer_tag = format!("{}-{}", cfg.consuming.queue, Uuid::new_v4());
        let deliveries = channel
            .basic_consume(&cfg.consuming.queue, &consumer_tag)
            .await?;

        info!(
            queue = cfg.consuming.queue,
            consumer_tag,
            prefetch = cfg.prefetch,
            "consumer started"
        );

        let token = handler.cancellation().clone();
        let handler = &handler;
        let delivering = channel.as_ref();
        let limit = (cfg.prefetch > 0).then_some(usize::from(cfg.prefetch));

        deliveries
            .take_until(token.cancelled())
            .for_each_concurrent(limit, |result| async move {
                match result {
                    Ok(delivery) => match handler.handle(delivering, delivery).await {
                        Ok(outcome) => debug!(?outcome, "delivery handled"),
                        Err(err) => error!(error = err.to_string(), "error consume msg"),
                    },
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            })
            .await;

        if !token.is_cancelled() {
            error!(consumer_tag, "delivery stream ended, consumer must be restarted");
            return Err(AmqpError::ConsumerError("delivery stream ended".to_owned()));
        }

        if let Err(err) = channel.basic_cancel(&consumer_tag).await {
            warn!(error = err.to_string(), consumer_tag, "failure to cancel the consumer");
        }

        info!(consumer_tag, "consumer stopped");

        Ok(())
    }
}
