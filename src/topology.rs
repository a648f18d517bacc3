// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchanges, queues and bindings the pipeline relies
//! on. Both sides get a dead-letter exchange/queue pair:
//!
//! - consuming: the live queue dead-letters into the dead-letter exchange, and
//!   the dead-letter queue holds messages for `ttl` milliseconds before sending
//!   them back to the live exchange with the binding key. A reject without
//!   requeue therefore becomes a delayed retry, with the broker keeping count in
//!   the `x-death` header.
//! - publishing: the dead-letter pair mirrors the consuming one, but the
//!   publishing queue itself carries no dead-letter arguments since this
//!   pipeline never consumes from it.
//!
//! Declarations are idempotent, so provisioning may run on every fresh channel.
//! Exchange types are checked before the first declaration.

use crate::{
    channel::AmqpChannel,
    config::BrokerConfiguration,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, info};

/// Exchanges, queues and bindings to be declared on a channel.
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn AmqpChannel,
    pub(crate) exchanges: Vec<ExchangeDefinition<'tp>>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn AmqpChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    pub fn exchange(mut self, def: ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues with their dead-letter arguments
    /// 3. Sets up queue-to-exchange bindings
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            self.channel
                .exchange_declare(exch.name, exch.kind, exch.durable)
                .await?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            self.channel
                .queue_declare(&def.name, def.durable, def.arguments())
                .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel
                .queue_bind(
                    binding.queue_name,
                    binding.exchange_name,
                    binding.routing_key,
                )
                .await?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

/// Declares the consuming exchange and queue together with their delayed-retry
/// dead-letter ring.
pub async fn provision_consuming(
    cfg: &BrokerConfiguration,
    channel: &dyn AmqpChannel,
) -> Result<(), AmqpError> {
    cfg.validate()?;

    let consuming = &cfg.consuming;
    let deadletter = &consuming.deadletter;

    info!(
        exchange = consuming.exchange.name,
        queue = consuming.queue,
        deadletter = deadletter.queue,
        "provisioning consuming topology"
    );

    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(&deadletter.exchange.name).kind(deadletter.exchange.kind()?))
        .exchange(ExchangeDefinition::new(&consuming.exchange.name).kind(consuming.exchange.kind()?))
        .queue(
            QueueDefinition::new(&deadletter.queue)
                .durable(cfg.durable)
                .dead_letter(&consuming.exchange.name, &consuming.binding_key)
                .ttl(cfg.ttl),
        )
        .queue(
            QueueDefinition::new(&consuming.queue)
                .durable(cfg.durable)
                .dead_letter(&deadletter.exchange.name, &deadletter.routing_key),
        )
        .queue_binding(
            QueueBinding::new(&deadletter.queue)
                .exchange(&deadletter.exchange.name)
                .routing_key(&deadletter.routing_key),
        )
        .queue_binding(
            QueueBinding::new(&consuming.queue)
                .exchange(&consuming.exchange.name)
                .routing_key(&consuming.binding_key),
        )
        .install()
        .await
}

/// Declares the publishing exchange and queue with a dead-letter pair of their
/// own.
pub async fn provision_publishing(
    cfg: &BrokerConfiguration,
    channel: &dyn AmqpChannel,
) -> Result<(), AmqpError> {
    cfg.validate()?;

    let publishing = &cfg.publishing;
    let deadletter = &publishing.deadletter;

    info!(
        exchange = publishing.exchange.name,
        queue = publishing.queue,
        deadletter = deadletter.queue,
        "provisioning publishing topology"
    );

    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(&deadletter.exchange.name).kind(deadletter.exchange.kind()?))
        .exchange(ExchangeDefinition::new(&publishing.exchange.name).kind(publishing.exchange.kind()?))
        .queue(
            QueueDefinition::new(&deadletter.queue)
                .durable(cfg.durable)
                .dead_letter(&publishing.exchange.name, &publishing.routing_key)
                .ttl(cfg.ttl),
        )
        .queue(QueueDefinition::new(&publishing.queue).durable(cfg.durable))
        .queue_binding(
            QueueBinding::new(&deadletter.queue)
                .exchange(&deadletter.exchange.name)
                .routing_key(&deadletter.routing_key),
        )
        .queue_binding(
            QueueBinding::new(&publishing.queue)
                .exchange(&publishing.exchange.name)
                .routing_key(&publishing.routing_key),
        )
        .install()
        .await
}
