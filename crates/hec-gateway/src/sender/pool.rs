// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::SenderError;
use crate::sender::{create_connection, Connection, ReliableSender, RetryPolicy};

pub type DynSender = ReliableSender<Box<dyn Connection>>;

/// Where and how the pool's senders connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSettings {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub retry: RetryPolicy,
}

/// Long-lived senders shared by all requests, handed out round-robin.
///
/// Each sender sits behind its own async mutex, so a request waiting on a slow collector only
/// holds up requests that were routed to the same sender.
pub struct SenderPool {
    senders: Vec<Mutex<DynSender>>,
    next: AtomicUsize,
}

impl SenderPool {
    /// Connects `settings.connections` senders. Returns once all of them are connected.
    pub async fn connect(settings: &SenderSettings) -> Result<Self, SenderError> {
        let mut senders = Vec::with_capacity(settings.connections);
        for index in 0..settings.connections {
            let connection = create_connection(&settings.protocol, &settings.host, settings.port)?;
            let sender = ReliableSender::connect(connection, settings.retry).await?;
            debug!(
                "Sender {} of {} connected to {}",
                index + 1,
                settings.connections,
                sender.connection().target()
            );
            senders.push(sender);
        }
        Self::from_senders(senders)
    }

    pub fn from_senders(senders: Vec<DynSender>) -> Result<Self, SenderError> {
        if senders.is_empty() {
            return Err(SenderError::EmptyPool);
        }
        Ok(Self {
            senders: senders.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Sends `messages` as one batch on the next sender in turn.
    pub async fn send<M>(&self, messages: &[M]) -> Result<(), SenderError>
    where
        M: AsRef<[u8]> + Sync,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let mut sender = self.senders[index].lock().await;
        sender.send(messages).await
    }

    pub async fn close(&self) {
        for sender in &self.senders {
            sender.lock().await.close().await;
        }
    }
}
