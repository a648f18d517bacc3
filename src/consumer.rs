// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module turns a raw delivery into a typed callback invocation and settles
//! the delivery afterwards:
//!
//! 1. The attempt number is read from the `x-death` header (previous dead-letter
//!    cycles plus the current one)
//! 2. The body is decoded as UTF-8 and deserialized into the payload type
//! 3. The callback runs with the raw text and the payload
//! 4. Success acks the delivery
//! 5. Any failure while decoding or processing rejects the delivery without
//!    requeue, sending it around the dead-letter ring, as long as the attempt is
//!    below `max_retries`. Past that, the configured [`ExhaustedPolicy`] applies.
//!
//! A `null` payload is skipped: the callback is not invoked and the delivery is
//! neither acked nor rejected.

use crate::{
    channel::{AmqpChannel, InboundDelivery},
    config::{BrokerConfiguration, ExhaustedPolicy},
    errors::{AmqpError, HandlerError},
    otel,
};
use futures_util::{future::BoxFuture, FutureExt};
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Callback invoked with the raw text of a delivery and its decoded payload.
pub type Callback<T> =
    Arc<dyn Fn(String, T) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Boxes an async closure into a [`Callback`].
pub fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    T: 'static,
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |raw, payload| f(raw, payload).boxed())
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed and acked.
    Acked,
    /// Failed and rejected without requeue, it will come back after the TTL.
    Requeued,
    /// Failed with no retries left and left unsettled.
    Abandoned,
    /// Failed with no retries left and rejected for good.
    Rejected,
    /// Payload was `null`; nothing was done.
    Skipped,
}

/// Number of dead-letter cycles the delivery already went through.
///
/// Reads `x-death[0].count`. Missing or malformed headers count as zero.
pub fn retries_so_far(headers: &FieldTable) -> u32 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(as_count)
        .unwrap_or_default()
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u32::try_from(count).ok()
}

enum Processed {
    Done,
    Skipped,
}

/// Handler registered on the delivery stream of one queue subscription.
///
/// It only holds immutable settings and the callback, so the dispatcher may run
/// it for several deliveries at once. It never opens a connection: a delivery is
/// settled on the channel it arrived on, or not at all.
pub struct DeliveryHandler<T> {
    cancellation: CancellationToken,
    max_retries: u32,
    on_exhausted: ExhaustedPolicy,
    callback: Callback<T>,
}

impl<T> DeliveryHandler<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        cfg: &BrokerConfiguration,
        cancellation: CancellationToken,
        callback: Callback<T>,
    ) -> DeliveryHandler<T> {
        DeliveryHandler {
            cancellation,
            max_retries: cfg.max_retries,
            on_exhausted: cfg.on_exhausted,
            callback,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Processes one delivery and settles it on `channel`, which must be the
    /// channel the delivery arrived on.
    ///
    /// Fails with [`AmqpError::Canceled`] without touching the delivery once the
    /// cancellation signal fired, and with [`AmqpError::ChannelError`] once the
    /// channel is gone. Either way the broker redelivers it after the channel
    /// closes.
    pub async fn handle(
        &self,
        channel: &dyn AmqpChannel,
        delivery: InboundDelivery,
    ) -> Result<Outcome, AmqpError> {
        if self.cancellation.is_cancelled() {
            debug!(delivery_tag = delivery.delivery_tag, "consumer canceled, leaving message unacked");
            return Err(AmqpError::Canceled);
        }

        if !channel.is_open() {
            warn!(delivery_tag = delivery.delivery_tag, "channel closed, leaving message to be redelivered");
            return Err(AmqpError::ChannelError);
        }

        self.process(channel, delivery).await
    }

    pub(crate) async fn process(
        &self,
        channel: &dyn AmqpChannel,
        delivery: InboundDelivery,
    ) -> Result<Outcome, AmqpError> {
        let tag = delivery.delivery_tag;
        let attempt = retries_so_far(&delivery.headers).saturating_add(1);

        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let (_ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &delivery.routing_key);

        debug!(
            delivery_tag = tag,
            attempt,
            exchange = delivery.exchange,
            "received message"
        );

        let failure = match self.run(&delivery).await {
            Ok(Processed::Skipped) => {
                debug!(delivery_tag = tag, "empty payload, skipping message");
                span.set_status(Status::Ok);
                return Ok(Outcome::Skipped);
            }
            Ok(Processed::Done) => {
                debug!(delivery_tag = tag, "message successfully processed");
                return match channel.basic_ack(tag).await {
                    Ok(()) => {
                        span.set_status(Status::Ok);
                        Ok(Outcome::Acked)
                    }
                    Err(err) => {
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                        Err(err)
                    }
                };
            }
            Err(failure) => failure,
        };

        warn!(
            delivery_tag = tag,
            attempt,
            max_retries = self.max_retries,
            error = failure.to_string(),
            "error whiling handling msg"
        );
        span.set_status(Status::Error {
            description: Cow::from(failure.to_string()),
        });

        if attempt < self.max_retries {
            channel.basic_nack(tag, false).await.inspect_err(|err| {
                span.record_error(err);
            })?;
            debug!(delivery_tag = tag, "message has been nacked, requeuing for latter");
            return Ok(Outcome::Requeued);
        }

        match self.on_exhausted {
            ExhaustedPolicy::Abandon => {
                error!(delivery_tag = tag, attempt, "too many attempts, leaving message unsettled");
                Ok(Outcome::Abandoned)
            }
            ExhaustedPolicy::Reject => {
                error!(delivery_tag = tag, attempt, "too many attempts, rejecting message");
                channel.basic_nack(tag, false).await.inspect_err(|err| {
                    span.record_error(err);
                })?;
                Ok(Outcome::Rejected)
            }
        }
    }

    async fn run(&self, delivery: &InboundDelivery) -> Result<Processed, HandlerError> {
        let raw = String::from_utf8(delivery.data.clone())?;
        debug!(raw, "raw message");

        let Some(payload) = serde_json::from_str::<Option<T>>(&raw)? else {
            return Ok(Processed::Skipped);
        };

        match AssertUnwindSafe((self.callback)(raw, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map(|_| Processed::Done),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_owned());
                Err(reason.into())
            }
        }
    }
}
