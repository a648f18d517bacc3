// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP message headers: the publisher injects the
//! current context and the consumer extracts it to parent the span opened for
//! each delivery.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Tracer name used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Writes propagation fields into outgoing header entries.
pub(crate) struct HeaderInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Reads propagation fields from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a>(&'a FieldTable);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.inner().get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .inspect_err(|err| warn!(key, error = err.to_string(), "non utf-8 trace header"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.inner().keys().map(ShortString::as_str).collect()
    }
}

/// Writes the given context into outgoing headers.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(headers))
    });
}

/// Creates a consumer span parented by the context found in `headers`.
pub(crate) fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)));

    let span = tracer
        .span_builder(format!("{name} receive"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
