// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Events
//!
//! Health events raised by the broker connection (shutdown, callback failure,
//! blocked, recovered) are delivered through an [`EventDispatcher`] owned by the
//! [`BrokerConnection`](crate::connection::BrokerConnection). Subscribers are
//! plain closures registered on an explicit list; any event source, including a
//! fake one in tests, reports events by calling [`EventDispatcher::dispatch`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{error, info, Level};

/// Health event reported for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was closed by the broker or the network.
    Shutdown { reason: String },
    /// The client failed while running one of its own callbacks (channel error).
    CallbackException { error: String },
    /// The broker stopped accepting publishes, usually a resource alarm.
    Blocked { reason: String },
    Unblocked,
    /// A fresh connection replaced one that had been lost.
    RecoverySucceeded,
}

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Fan-out of [`ConnectionEvent`]s to registered subscribers.
///
/// Cloning the dispatcher shares the subscription list.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    next_id: Arc<AtomicU64>,
    subscribers: Arc<Mutex<Vec<(SubscriptionId, Subscriber)>>>,
}

impl EventDispatcher {
    pub fn new() -> EventDispatcher {
        EventDispatcher::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers the event to every subscriber in registration order.
    ///
    /// The list is snapshotted first, so a subscriber may (un)subscribe from
    /// inside its own handler.
    pub fn dispatch(&self, event: &ConnectionEvent) {
        let snapshot: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in snapshot {
            handler(event);
        }
    }
}

/// Level an event is reported at: failures are errors, recoveries are info.
pub fn severity(event: &ConnectionEvent) -> Level {
    match event {
        ConnectionEvent::Shutdown { .. }
        | ConnectionEvent::CallbackException { .. }
        | ConnectionEvent::Blocked { .. } => Level::ERROR,
        ConnectionEvent::Unblocked | ConnectionEvent::RecoverySucceeded => Level::INFO,
    }
}

/// Default subscriber installed by the broker connection.
///
/// `is_open` is the connection state observed at the time of the event; it is
/// `false` whenever the state could not be read. Shutdown and callback failures
/// are only worth reporting once the connection is really down.
pub fn log_event(event: &ConnectionEvent, is_open: bool) {
    let what = match event {
        ConnectionEvent::Shutdown { .. } | ConnectionEvent::CallbackException { .. } if is_open => {
            return;
        }
        ConnectionEvent::Shutdown { .. } => "was shutdown",
        ConnectionEvent::CallbackException { .. } => "raised an exception",
        ConnectionEvent::Blocked { .. } => "was blocked",
        ConnectionEvent::Unblocked => "was unblocked",
        ConnectionEvent::RecoverySucceeded => "was recovered",
    };

    if severity(event) == Level::ERROR {
        error!(?event, "connection on rabbitmq {what}");
    } else {
        info!(?event, "connection on rabbitmq {what}");
    }
}
