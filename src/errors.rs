// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliability Layer
//!
//! This module provides the error taxonomy for every broker interaction performed
//! by this crate: configuration problems detected before anything is declared,
//! transient broker failures, and failures while acknowledging or rejecting a
//! delivery.

use thiserror::Error;

/// Error returned by a consumer callback.
///
/// Any failure raised while processing a delivery is handled the same way, so the
/// callback is free to return whatever error type it already uses.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Configuration variants are fatal and must stop the process from consuming.
/// The remaining variants describe which broker operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or missing configuration value
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Exchange type outside of direct, fanout, headers and topic
    #[error("exchange type `{0}` not implemented")]
    UnknownExchangeKind(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error receiving a delivery from the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The cancellation signal fired before the operation started
    #[error("operation canceled")]
    Canceled,
}
