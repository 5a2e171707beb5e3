// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::TransportError;
use crate::sender::{Batch, Connection};

#[derive(Debug, Default)]
struct Recorded {
    delivered: Vec<String>,
    connects: usize,
    commits: usize,
    connected: bool,
}

/// Shared view of what a [`MemoryConnection`] has received. Stays usable after the connection
/// has been moved into a sender.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    inner: Arc<Mutex<Recorded>>,
}

impl MemoryRecorder {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Confirmed messages in confirmation order.
    pub fn delivered(&self) -> Vec<String> {
        self.lock().delivered.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// In-process transport that records frames instead of sending them.
///
/// Failures can be scripted: the first `n` connects fail, and the first `n` commits confirm every
/// pending entry but the last one before failing. A stalling commit never completes.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    recorder: MemoryRecorder,
    failing_connects: usize,
    failing_commits: usize,
    stalling_commits: usize,
    failing_disconnect: bool,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_connects(mut self, count: usize) -> Self {
        self.failing_connects = count;
        self
    }

    #[must_use]
    pub fn failing_commits(mut self, count: usize) -> Self {
        self.failing_commits = count;
        self
    }

    #[must_use]
    pub fn stalling_commits(mut self, count: usize) -> Self {
        self.stalling_commits = count;
        self
    }

    #[must_use]
    pub fn failing_disconnect(mut self) -> Self {
        self.failing_disconnect = true;
        self
    }

    pub fn recorder(&self) -> MemoryRecorder {
        self.recorder.clone()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn target(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut recorded = self.recorder.lock();
        recorded.connects += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(TransportError::Protocol("scripted connect failure".to_string()));
        }
        recorded.connected = true;
        Ok(())
    }

    async fn commit(&mut self, batch: &mut Batch) -> Result<(), TransportError> {
        if self.stalling_commits > 0 {
            self.stalling_commits -= 1;
            self.recorder.lock().commits += 1;
            return std::future::pending().await;
        }
        let mut recorded = self.recorder.lock();
        if !recorded.connected {
            return Err(TransportError::NotConnected);
        }
        recorded.commits += 1;

        let pending: Vec<(usize, Bytes)> = batch
            .pending()
            .map(|(index, payload)| (index, payload.clone()))
            .collect();
        let failing = self.failing_commits > 0;
        let confirm = if failing {
            self.failing_commits -= 1;
            pending.len().saturating_sub(1)
        } else {
            pending.len()
        };

        for (index, payload) in &pending[..confirm] {
            recorded
                .delivered
                .push(String::from_utf8_lossy(payload).into_owned());
            batch.mark_committed(*index);
        }

        if failing {
            return Err(TransportError::ServerClose);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.failing_disconnect {
            return Err(TransportError::Protocol("scripted disconnect failure".to_string()));
        }
        self.recorder.lock().connected = false;
        Ok(())
    }

    fn tear_down(&mut self) {
        self.recorder.lock().connected = false;
    }
}
