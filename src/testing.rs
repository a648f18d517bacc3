// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory stand-ins for the broker used by the unit tests.

use crate::{
    channel::{AmqpChannel, DeliveryStream, InboundDelivery},
    config::BrokerConfiguration,
    connection::{ConnectionHandle, Connector, Session},
    errors::AmqpError,
    events::{ConnectionEvent, EventDispatcher},
    exchange::ExchangeKind,
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    arguments: FieldTable,
    messages: VecDeque<InboundDelivery>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: BTreeMap<String, (ExchangeKind, bool)>,
    queues: BTreeMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    next_tag: u64,
    qos: Option<u16>,
    consumers: Vec<String>,
    cancelled: Vec<String>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    unknown_tags: Vec<u64>,
    published: Vec<Published>,
}

/// Broker that keeps declarations in memory.
///
/// Re-declaring an identical exchange or queue is a no-op, a conflicting one
/// fails like a `PRECONDITION_FAILED`, and bindings are a set.
#[derive(Default)]
pub(crate) struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn exchanges(&self) -> BTreeMap<String, (ExchangeKind, bool)> {
        self.state().exchanges.clone()
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state().queues.get(queue).map(|q| q.arguments.clone())
    }

    pub fn queue_durable(&self, queue: &str) -> Option<bool> {
        self.state().queues.get(queue).map(|q| q.durable)
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    pub fn qos(&self) -> Option<u16> {
        self.state().qos
    }

    pub fn consumers(&self) -> Vec<String> {
        self.state().consumers.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state().nacks.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Tags settled on a channel that never delivered them.
    pub fn unknown_tags(&self) -> Vec<u64> {
        self.state().unknown_tags.clone()
    }

    fn take_messages(&self, queue: &str, consumer_tag: &str) -> Result<Vec<InboundDelivery>, AmqpError> {
        let mut state = self.state();
        state.consumers.push(consumer_tag.to_owned());

        let Some(queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };

        Ok(queue.messages.drain(..).collect())
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

#[async_trait]
impl AmqpChannel for InMemoryBroker {
    fn is_open(&self) -> bool {
        true
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        match state.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => {
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                state.exchanges.insert(name.to_owned(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable || existing.arguments != arguments => {
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_owned(),
                    QueueState {
                        durable,
                        arguments,
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state().qos = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let pending = self.take_messages(queue, consumer_tag)?;
        Ok(stream::iter(pending.into_iter().map(Ok)).boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state().cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state().acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state().nacks.push((delivery_tag, requeue));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.clone(),
            properties: properties.clone(),
        });

        let targets: Vec<String> = match state.exchanges.get(exchange) {
            Some((kind, _)) => state
                .bindings
                .iter()
                .filter(|(_, ex, key)| ex == exchange && routes(*kind, key, routing_key))
                .map(|(queue, _, _)| queue.clone())
                .collect(),
            None if exchange.is_empty() => vec![routing_key.to_owned()],
            None => vec![],
        };

        for target in targets {
            state.next_tag += 1;
            let delivery = InboundDelivery {
                delivery_tag: state.next_tag,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                headers: properties.headers().clone().unwrap_or_default(),
                data: payload.clone(),
            };
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(delivery);
            }
        }

        Ok(())
    }
}

/// State shared by one fake connection and the channel opened on it.
struct FakeLink {
    open: AtomicBool,
    closed: CancellationToken,
}

impl FakeLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Channel of one fake session.
///
/// Delivery tags are only valid on the channel that handed them out, and the
/// delivery stream stays open until the connection goes away.
pub(crate) struct FakeChannel {
    broker: Arc<InMemoryBroker>,
    link: Arc<FakeLink>,
    issued: Mutex<HashSet<u64>>,
}

impl FakeChannel {
    fn settle(&self, delivery_tag: u64) -> bool {
        let known = self.issued.lock().unwrap().remove(&delivery_tag);
        if !known {
            self.broker.state().unknown_tags.push(delivery_tag);
            // the broker closes the channel on PRECONDITION_FAILED
            self.link.shut();
        }
        known
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError> {
        self.broker.exchange_declare(name, kind, durable).await
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.broker.queue_declare(name, durable, arguments).await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.broker.queue_bind(queue, exchange, routing_key).await
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.broker.basic_qos(prefetch_count).await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let pending = self.broker.take_messages(queue, consumer_tag)?;
        self.issued
            .lock()
            .unwrap()
            .extend(pending.iter().map(|d| d.delivery_tag));

        let closed = self.link.closed.clone();
        let until_closed = stream::once(async move { closed.cancelled().await })
            .filter_map(|()| future::ready(None::<Result<InboundDelivery, AmqpError>>));

        Ok(stream::iter(pending.into_iter().map(Ok))
            .chain(until_closed)
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ConsumerCancelError(consumer_tag.to_owned()));
        }
        self.broker.basic_cancel(consumer_tag).await
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if !self.is_open() || !self.settle(delivery_tag) {
            return Err(AmqpError::AckMessageError);
        }
        self.broker.basic_ack(delivery_tag).await
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if !self.is_open() || !self.settle(delivery_tag) {
            return Err(AmqpError::NackMessageError);
        }
        self.broker.basic_nack(delivery_tag, requeue).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError);
        }
        self.broker
            .basic_publish(exchange, routing_key, payload, properties)
            .await
    }
}

/// Connection handle of one fake session.
///
/// Like a `lapin` connection with its error callbacks, it keeps the event
/// dispatcher alive.
struct FakeConnection {
    link: Arc<FakeLink>,
    closes: Arc<AtomicUsize>,
    _events: EventDispatcher,
}

#[async_trait]
impl ConnectionHandle for FakeConnection {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.link.shut();
        Ok(())
    }
}

/// Connector handing out a fresh channel per session, all on one shared
/// [`InMemoryBroker`].
///
/// It keeps the dispatcher it was given so tests can raise connection events.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub broker: Arc<InMemoryBroker>,
    attempts: AtomicUsize,
    opens: AtomicUsize,
    fail: AtomicBool,
    closes: Arc<AtomicUsize>,
    current: Mutex<Weak<FakeLink>>,
    events: Mutex<Option<EventDispatcher>>,
}

impl FakeConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Whether the last session handed out is still owned by someone.
    pub fn session_alive(&self) -> bool {
        self.current.lock().unwrap().upgrade().is_some()
    }

    /// Simulates the broker dropping the connection.
    pub fn drop_connection(&self) {
        let link = self.current.lock().unwrap().upgrade();
        if let Some(link) = link {
            link.shut();
        }
        self.emit(ConnectionEvent::Shutdown {
            reason: "connection reset by peer".to_owned(),
        });
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            events.dispatch(&event);
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _cfg: &BrokerConfiguration,
        events: &EventDispatcher,
    ) -> Result<Session, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError);
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(FakeLink {
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        });
        *self.current.lock().unwrap() = Arc::downgrade(&link);
        *self.events.lock().unwrap() = Some(events.clone());

        Ok(Session {
            channel: Arc::new(FakeChannel {
                broker: self.broker.clone(),
                link: link.clone(),
                issued: Mutex::default(),
            }),
            connection: Arc::new(FakeConnection {
                link,
                closes: self.closes.clone(),
                _events: events.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(routes(ExchangeKind::Topic, "ping.*", "ping.created"));
        assert!(routes(ExchangeKind::Topic, "ping.#", "ping"));
        assert!(routes(ExchangeKind::Topic, "#", "a.b.c"));
        assert!(!routes(ExchangeKind::Topic, "ping.*", "ping.a.b"));
        assert!(!routes(ExchangeKind::Direct, "ping", "pong"));
    }

    #[tokio::test]
    async fn delivery_tags_belong_to_their_channel() {
        let cfg = crate::config::tests::sample();
        let connector = FakeConnector::default();
        let events = EventDispatcher::new();

        let first = connector.open(&cfg, &events).await.unwrap();
        first.channel.queue_declare("q", true, FieldTable::default()).await.unwrap();
        first
            .channel
            .basic_publish("", "q", b"x".to_vec(), BasicProperties::default())
            .await
            .unwrap();
        let mut deliveries = first.channel.basic_consume("q", "c").await.unwrap();
        let tag = deliveries.next().await.unwrap().unwrap().delivery_tag;

        let second = connector.open(&cfg, &events).await.unwrap();

        assert_eq!(
            second.channel.basic_ack(tag).await,
            Err(AmqpError::AckMessageError)
        );
        assert_eq!(connector.broker.unknown_tags(), vec![tag]);
        assert!(!second.channel.is_open());
        assert!(first.channel.is_open());
    }
}
