// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
