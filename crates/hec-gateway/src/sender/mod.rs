// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Guaranteed delivery of formatted messages to the downstream collector.
//!
//! A [`ReliableSender`] owns exactly one [`Connection`] and hides every transport failure from
//! its caller: connecting and sending loop until the collector has confirmed every message, per
//! the injected [`RetryPolicy`].
//!
//! ```text
//!   Connecting ──> Connected ⇄ Sending
//!       ^              │
//!       └── failure ───┘        close() from any state ──> Closed
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{SenderError, TransportError};

pub mod memory;
pub mod pool;
pub mod relp;

pub use memory::{MemoryConnection, MemoryRecorder};
pub use pool::SenderPool;
pub use relp::RelpConnection;

/// Transport variants a sender can be built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Relp,
    /// Keeps frames in memory. Never reaches a collector.
    Memory,
}

impl FromStr for Protocol {
    type Err = SenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relp" => Ok(Protocol::Relp),
            "memory" => Ok(Protocol::Memory),
            _ => Err(SenderError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// Builds an unconnected transport for `protocol` targeting `host:port`.
///
/// Fails with [`SenderError::UnsupportedProtocol`] naming the offending value.
pub fn create_connection(
    protocol: &str,
    host: &str,
    port: u16,
) -> Result<Box<dyn Connection>, SenderError> {
    match protocol.parse::<Protocol>()? {
        Protocol::Relp => Ok(Box::new(RelpConnection::new(host, port))),
        Protocol::Memory => Ok(Box::new(MemoryConnection::new())),
    }
}

/// How long to wait between attempts, and how many attempts to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until success.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Debug, Clone)]
struct BatchEntry {
    payload: Bytes,
    committed: bool,
}

/// Messages submitted together, each tracked until the collector confirms it.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new<I, M>(messages: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Bytes>,
    {
        Self {
            entries: messages
                .into_iter()
                .map(|message| BatchEntry {
                    payload: message.into(),
                    committed: false,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries not yet confirmed, with their position in the batch.
    pub fn pending(&self) -> impl Iterator<Item = (usize, &Bytes)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.committed)
            .map(|(index, entry)| (index, &entry.payload))
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.committed).count()
    }

    pub fn mark_committed(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.committed = true;
        }
    }

    /// `true` once every entry has been confirmed.
    pub fn verify_all(&self) -> bool {
        self.entries.iter().all(|entry| entry.committed)
    }
}

/// One transport endpoint to one collector address.
#[async_trait]
pub trait Connection: Send {
    /// Human readable target, used in logs.
    fn target(&self) -> String;

    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Transmits every pending entry of `batch` and marks the ones the collector confirmed.
    ///
    /// An error leaves unconfirmed entries pending; entries confirmed before the error stay
    /// committed.
    async fn commit(&mut self, batch: &mut Batch) -> Result<(), TransportError>;

    /// Orderly shutdown of the session.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drops the underlying socket without any handshake.
    fn tear_down(&mut self);
}

#[async_trait]
impl<C: Connection + ?Sized> Connection for Box<C> {
    fn target(&self) -> String {
        (**self).target()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect().await
    }

    async fn commit(&mut self, batch: &mut Batch) -> Result<(), TransportError> {
        (**self).commit(batch).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        (**self).disconnect().await
    }

    fn tear_down(&mut self) {
        (**self).tear_down();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Connecting,
    Connected,
    Sending,
    Closed,
}

pub struct ReliableSender<C> {
    connection: C,
    policy: RetryPolicy,
    state: SenderState,
}

impl<C: Connection> ReliableSender<C> {
    /// Opens `connection`, retrying per `policy`. With the default policy this only returns
    /// once the collector has accepted the connection.
    pub async fn connect(connection: C, policy: RetryPolicy) -> Result<Self, SenderError> {
        let mut sender = Self {
            connection,
            policy,
            state: SenderState::Connecting,
        };
        sender.establish().await?;
        Ok(sender)
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Sends `messages` as one batch and returns once every message has been confirmed.
    ///
    /// Unconfirmed messages are resent on a fresh connection; confirmed ones are never resent.
    pub async fn send<M>(&mut self, messages: &[M]) -> Result<(), SenderError>
    where
        M: AsRef<[u8]>,
    {
        if self.state == SenderState::Closed {
            return Err(SenderError::Closed);
        }
        if self.state == SenderState::Sending {
            // A previous send was dropped mid-commit, the stream may hold a partial frame.
            warn!(
                "Previous send to {} was interrupted, reconnecting",
                self.connection.target()
            );
            self.connection.tear_down();
            self.state = SenderState::Connecting;
        }
        let mut batch = Batch::new(
            messages
                .iter()
                .map(|message| Bytes::copy_from_slice(message.as_ref())),
        );
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts: u32 = 0;
        loop {
            if self.state == SenderState::Connecting {
                self.establish().await?;
            }
            self.state = SenderState::Sending;
            attempts += 1;
            debug!(
                "Committing a batch of {} messages to {}",
                batch.pending_count(),
                self.connection.target()
            );
            if let Err(e) = self.connection.commit(&mut batch).await {
                warn!("Failed to commit batch to {}: {e}", self.connection.target());
            }

            if batch.verify_all() {
                self.state = SenderState::Connected;
                return Ok(());
            }

            debug!(
                "Failed to verify {} of {} messages, retrying them",
                batch.pending_count(),
                batch.len()
            );
            self.connection.tear_down();
            self.state = SenderState::Connecting;
            if self.policy.exhausted(attempts) {
                return Err(SenderError::RetriesExhausted { attempts });
            }
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Best effort orderly shutdown. Errors are logged, the connection is discarded regardless.
    pub async fn close(&mut self) {
        if self.state == SenderState::Closed {
            return;
        }
        if self.state != SenderState::Connecting {
            debug!("Disconnecting from {}", self.connection.target());
            if let Err(e) = self.connection.disconnect().await {
                warn!("Failed to disconnect from {}: {e}", self.connection.target());
            }
        }
        self.connection.tear_down();
        self.state = SenderState::Closed;
    }

    async fn establish(&mut self) -> Result<(), SenderError> {
        self.state = SenderState::Connecting;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            debug!("Connecting to {}", self.connection.target());
            match self.connection.connect().await {
                Ok(()) => {
                    self.state = SenderState::Connected;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {e}", self.connection.target());
                    self.connection.tear_down();
                }
            }
            if self.policy.exhausted(attempts) {
                return Err(SenderError::RetriesExhausted { attempts });
            }
            debug!(
                "Sleeping for {:?} before reconnecting",
                self.policy.interval
            );
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}
