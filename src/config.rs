// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Process-wide settings describing how to reach the broker and which topology
//! to provision. The configuration is loaded once and is immutable afterwards;
//! components share it behind an `Arc`.
//!
//! Exchange types are kept as plain strings here and parsed by the topology
//! provisioner, so an unknown type is reported as a configuration error before
//! anything is declared on the broker.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::error;

/// Default file looked up by [`BrokerConfiguration::load`], extension optional
pub const DEFAULT_CONFIG_FILE: &str = "config/rabbitmq";
/// Prefix for environment overrides, e.g. `RABBITMQ__CONSUMING__QUEUE`
pub const ENV_PREFIX: &str = "RABBITMQ";

/// What the consume pipeline does with a delivery that failed after its retry
/// budget is spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Leave the delivery neither acked nor nacked. It stays unacked until the
    /// channel closes and the broker redelivers it.
    #[default]
    Abandon,
    /// Reject the delivery without requeue one last time.
    Reject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExchangeConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ExchangeConfiguration {
    pub fn kind(&self) -> Result<ExchangeKind, AmqpError> {
        self.kind.parse()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeadLetterConfiguration {
    pub queue: String,
    pub routing_key: String,
    pub exchange: ExchangeConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsumingConfiguration {
    pub queue: String,
    pub binding_key: String,
    pub exchange: ExchangeConfiguration,
    pub deadletter: DeadLetterConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublishingConfiguration {
    pub queue: String,
    pub routing_key: String,
    pub exchange: ExchangeConfiguration,
    pub deadletter: DeadLetterConfiguration,
}

/// Settings for the broker connection and the consuming/publishing topology.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerConfiguration {
    /// Candidate broker hosts, tried in order. Empty means the URI host.
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub connection_string: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// Whether declared queues survive a broker restart.
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// TTL in milliseconds of the dead-letter queues, i.e. the retry delay.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Unacked deliveries the broker may push to the consumer at once.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    pub consuming: ConsumingConfiguration,
    pub publishing: PublishingConfiguration,
}

fn default_connection_name() -> String {
    "rabbitmq-reliability".to_owned()
}

fn default_durable() -> bool {
    true
}

fn default_ttl() -> i64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_prefetch() -> u16 {
    10
}

impl BrokerConfiguration {
    /// Loads the configuration from [`DEFAULT_CONFIG_FILE`] (if present) and
    /// `RABBITMQ__*` environment variables.
    pub fn load() -> Result<BrokerConfiguration, AmqpError> {
        Self::build(Config::builder().add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)))
    }

    /// Loads the configuration from the given file, still honouring environment
    /// overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<BrokerConfiguration, AmqpError> {
        Self::build(Config::builder().add_source(File::from(path.as_ref())))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<BrokerConfiguration, AmqpError> {
        let cfg: BrokerConfiguration = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("hostnames"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load broker configuration");
                AmqpError::ConfigurationError(err.to_string())
            })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks required fields and exchange types.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.connection_string.trim().is_empty() {
            return Err(AmqpError::ConfigurationError(
                "connection_string is required".to_owned(),
            ));
        }

        let required = [
            ("consuming.queue", &self.consuming.queue),
            ("consuming.exchange.name", &self.consuming.exchange.name),
            ("consuming.deadletter.queue", &self.consuming.deadletter.queue),
            (
                "consuming.deadletter.exchange.name",
                &self.consuming.deadletter.exchange.name,
            ),
            ("publishing.queue", &self.publishing.queue),
            ("publishing.exchange.name", &self.publishing.exchange.name),
            ("publishing.deadletter.queue", &self.publishing.deadletter.queue),
            (
                "publishing.deadletter.exchange.name",
                &self.publishing.deadletter.exchange.name,
            ),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AmqpError::ConfigurationError(format!("{field} is required")));
            }
        }

        self.consuming.exchange.kind()?;
        self.consuming.deadletter.exchange.kind()?;
        self.publishing.exchange.kind()?;
        self.publishing.deadletter.exchange.kind()?;

        Ok(())
    }
}
