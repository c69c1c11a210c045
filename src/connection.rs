//! Realtime connection lifecycle and reconnect policy.
//!
//! The manager owns at most one live connection. Transport failures are
//! retried a bounded number of times with a fixed delay; a disconnect
//! initiated by the server gets one immediate attempt first. Authorization
//! failures are never retried.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::models::Session;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        ReconnectPolicy {
            max_attempts: max_attempts.clamp(1, MAX_RECONNECT_ATTEMPTS),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::new(MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerInitiated,
    TransportFailure(String),
    ClientInitiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Error(String),
    Disconnected,
}

/// Opens one transport-level connection for a session.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Connection;

    async fn connect(&mut self, session: &Session) -> Result<Self::Connection, ClientError>;
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    session: Option<Session>,
    connection: Option<C::Connection>,
    state: ConnectionState,
    observers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        ConnectionManager {
            connector,
            policy,
            session: None,
            connection: None,
            state: ConnectionState::Idle,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn connection(&self) -> Option<&C::Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C::Connection> {
        self.connection.as_mut()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Establishes the connection for `session`, replacing any live one.
    pub async fn connect(&mut self, session: Session) -> Result<(), ClientError> {
        if self.connection.take().is_some() {
            debug!("Dropping previous connection before reconnecting");
        }
        if !session.has_credential() {
            return Err(self.fail(ClientError::Unauthorized("missing credential".to_string())));
        }
        self.session = Some(session);
        self.state = ConnectionState::Connecting;

        match self.attempt().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!("Connection failed: {}", err);
                self.emit(ConnectionEvent::Error(err.to_string()));
                self.retry_with_backoff().await
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Reacts to the live connection going away.
    pub async fn handle_disconnect(&mut self, reason: DisconnectReason) -> Result<(), ClientError> {
        self.connection = None;
        if self.session.is_none() {
            return Err(ClientError::NotConnected);
        }

        match reason {
            DisconnectReason::ClientInitiated => {
                self.disconnect();
                Ok(())
            }
            DisconnectReason::PeerInitiated => {
                info!("Server closed the connection, reconnecting immediately");
                self.state = ConnectionState::Reconnecting;
                self.emit(ConnectionEvent::Reconnecting {
                    attempt: 0,
                    delay: Duration::ZERO,
                });
                match self.attempt().await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_retryable() => {
                        warn!("Immediate reconnect failed: {}", err);
                        self.emit(ConnectionEvent::Error(err.to_string()));
                        self.retry_with_backoff().await
                    }
                    Err(err) => Err(self.fail(err)),
                }
            }
            DisconnectReason::TransportFailure(message) => {
                warn!("Connection lost: {}", message);
                self.emit(ConnectionEvent::Error(message));
                self.retry_with_backoff().await
            }
        }
    }

    /// Drops the connection and the session. No reconnect follows.
    pub fn disconnect(&mut self) {
        self.connection = None;
        self.session = None;
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    async fn attempt(&mut self) -> Result<(), ClientError> {
        let session = self.session.clone().ok_or(ClientError::NotConnected)?;
        let connection = self.connector.connect(&session).await?;
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        info!("Connected to chat server");
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    async fn retry_with_backoff(&mut self) -> Result<(), ClientError> {
        let attempts = self.policy.max_attempts;
        let delay = self.policy.delay;
        self.state = ConnectionState::Reconnecting;

        for attempt in 1..=attempts {
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;
            match self.attempt().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, err);
                    self.emit(ConnectionEvent::Error(err.to_string()));
                }
                Err(err) => return Err(self.fail(err)),
            }
        }

        self.state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::Disconnected);
        Err(ClientError::Disconnected { attempts })
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        warn!("Connection not established: {}", err);
        self.connection = None;
        self.state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::Error(err.to_string()));
        err
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
