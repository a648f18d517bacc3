// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! This module owns the single physical connection and channel shared by the
//! process. The channel is opened lazily on the first call to
//! [`BrokerConnection::initialize`], the topology is provisioned on it, and the
//! same handle is returned to every later caller while the connection stays up.
//!
//! Callers borrow the channel per call and must not keep it around: when the
//! memoized connection is found closed, the next `initialize` opens a new one,
//! provisions it again and reports [`ConnectionEvent::RecoverySucceeded`].
//! Connection failures are returned to the caller as-is; retrying is up to the
//! host.

use crate::{
    channel::{AmqpChannel, LapinChannel},
    config::BrokerConfiguration,
    errors::AmqpError,
    events::{log_event, ConnectionEvent, EventDispatcher},
    topology,
};
use async_trait::async_trait;
use lapin::{types::LongString, uri::AMQPUri, Connection, ConnectionProperties};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Heartbeat requested when the connection string does not set one, in seconds
pub const DEFAULT_HEARTBEAT: u16 = 200;

/// A physical connection as seen by [`BrokerConnection`].
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open connection together with the channel created on it.
pub struct Session {
    pub channel: Arc<dyn AmqpChannel>,
    pub connection: Arc<dyn ConnectionHandle>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }
}

/// Opens sessions to the broker.
///
/// Implementations report connection health through the given dispatcher.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        cfg: &BrokerConfiguration,
        events: &EventDispatcher,
    ) -> Result<Session, AmqpError>;
}

/// [`Connector`] opening `lapin` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

impl LapinConnector {
    /// Builds one URI per candidate host, in order.
    ///
    /// The host of the connection string is replaced by each entry of
    /// `hostnames`; credentials, port, vhost and query are kept. A missing
    /// `heartbeat` parameter defaults to [`DEFAULT_HEARTBEAT`].
    pub fn candidates(cfg: &BrokerConfiguration) -> Result<Vec<AMQPUri>, AmqpError> {
        let mut uri: AMQPUri = cfg.connection_string.parse().map_err(|err: String| {
            error!(error = err, "invalid connection string");
            AmqpError::ConfigurationError(format!("invalid connection string: {err}"))
        })?;

        if uri.query.heartbeat.is_none() {
            uri.query.heartbeat = Some(DEFAULT_HEARTBEAT);
        }

        if cfg.hostnames.is_empty() {
            return Ok(vec![uri]);
        }

        Ok(cfg
            .hostnames
            .iter()
            .map(|host| {
                let mut candidate = uri.clone();
                candidate.authority.host = host.clone();
                candidate
            })
            .collect())
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn open(
        &self,
        cfg: &BrokerConfiguration,
        events: &EventDispatcher,
    ) -> Result<Session, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let mut conn = None;
        for uri in Self::candidates(cfg)? {
            let host = uri.authority.host.clone();
            debug!(host, "creating amqp connection...");

            match Connection::connect_uri(uri, options.clone()).await {
                Ok(c) => {
                    info!(host, "amqp connected");
                    conn = Some(c);
                    break;
                }
                Err(err) => warn!(error = err.to_string(), host, "failure to connect"),
            }
        }

        let Some(conn) = conn else {
            error!("failure to connect to every configured host");
            return Err(AmqpError::ConnectionError);
        };

        let dispatcher = events.clone();
        conn.on_error(move |err| {
            dispatcher.dispatch(&ConnectionEvent::Shutdown {
                reason: err.to_string(),
            })
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        let dispatcher = events.clone();
        channel.on_error(move |err| {
            dispatcher.dispatch(&ConnectionEvent::CallbackException {
                error: err.to_string(),
            })
        });

        Ok(Session {
            channel: Arc::new(LapinChannel::new(channel)),
            connection: Arc::new(LapinConnection { connection: conn }),
        })
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl ConnectionHandle for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection.close(200, "disconnect").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError
        })
    }
}

/// Lazily opened, memoized broker connection shared by the consume and publish
/// paths.
pub struct BrokerConnection {
    cfg: Arc<BrokerConfiguration>,
    connector: Arc<dyn Connector>,
    events: EventDispatcher,
    session: Arc<RwLock<Option<Session>>>,
    opening: Mutex<()>,
}

impl BrokerConnection {
    pub fn new(cfg: Arc<BrokerConfiguration>) -> BrokerConnection {
        Self::with_connector(cfg, Arc::new(LapinConnector))
    }

    /// Creates a connection using a custom [`Connector`].
    ///
    /// A logging subscriber is registered on the event dispatcher straight away.
    pub fn with_connector(
        cfg: Arc<BrokerConfiguration>,
        connector: Arc<dyn Connector>,
    ) -> BrokerConnection {
        let events = EventDispatcher::new();
        let session: Arc<RwLock<Option<Session>>> = Arc::default();

        // lapin's error callbacks keep the dispatcher alive, so the subscriber
        // must not own the session holding them
        let observed = Arc::downgrade(&session);
        events.subscribe(move |event| {
            let is_open = observed
                .upgrade()
                .map(|session| observed_open(&session))
                .unwrap_or(false);
            log_event(event, is_open);
        });

        BrokerConnection {
            cfg,
            connector,
            events,
            session,
            opening: Mutex::new(()),
        }
    }

    pub fn configuration(&self) -> &Arc<BrokerConfiguration> {
        &self.cfg
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.read_session()
            .as_ref()
            .map(Session::is_open)
            .unwrap_or(false)
    }

    /// Returns the shared channel, connecting and provisioning the topology
    /// first if needed.
    ///
    /// Configuration errors surface from provisioning; the fresh connection is
    /// closed again and nothing is memoized.
    pub async fn initialize(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        let _opening = self.opening.lock().await;
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        let recovering = self.read_session().is_some();
        if recovering {
            warn!("amqp connection was lost, reconnecting");
        }

        info!("creating rabbitmq connection");
        let session = self.connector.open(&self.cfg, &self.events).await?;

        if let Err(err) = self.provision(session.channel.as_ref()).await {
            if let Err(close_err) = session.connection.close().await {
                warn!(error = close_err.to_string(), "error to close after provisioning failure");
            }
            return Err(err);
        }

        let channel = session.channel.clone();
        *self.write_session() = Some(session);

        if recovering {
            self.events.dispatch(&ConnectionEvent::RecoverySucceeded);
        }

        Ok(channel)
    }

    /// Closes the connection if it is open. Never fails.
    pub async fn disconnect(&self) {
        let session = self.write_session().take();

        match session {
            Some(session) if session.connection.is_open() => {
                info!("closing rabbitmq connection");
                if let Err(err) = session.connection.close().await {
                    warn!(error = err.to_string(), "error to close the connection");
                }
            }
            _ => debug!("rabbitmq connection is not open, nothing to close"),
        }
    }

    async fn provision(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        topology::provision_consuming(&self.cfg, channel).await?;
        topology::provision_publishing(&self.cfg, channel).await
    }

    fn open_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.read_session()
            .as_ref()
            .filter(|session| session.is_open())
            .map(|session| session.channel.clone())
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads the session state without blocking; the event may fire while the
/// session is being swapped.
fn observed_open(session: &RwLock<Option<Session>>) -> bool {
    let Ok(guard) = session.try_read() else {
        return false;
    };
    guard.as_ref().map(Session::is_open).unwrap_or(false)
}
