// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery acknowledgement tracking.
//!
//! Every event accepted on a named channel gets an ack id. The id starts out unacknowledged,
//! flips to acknowledged once the sender has committed the event downstream, and disappears the
//! first time a client asks about it (one-shot report). State is kept per authentication token
//! (session) and per channel within a session:
//!
//! ```text
//!   AckManager
//!     └── token ──> Session (last access)
//!                     └── channel ──> Channel (next ack value, id -> Ack)
//! ```
//!
//! - **[`manager`]**: the registry and its operations
//! - **[`sweeper`]**: background task evicting idle sessions and stale acks

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub mod manager;
pub mod sweeper;

pub use manager::{AckManager, SweepReport};
pub use sweeper::spawn_sweeper;

/// Channel name used for requests that do not name a channel.
pub const DEFAULT_CHANNEL: &str = "defaultchannel";

/// One tracked event within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub id: u64,
    pub acknowledged: bool,
}

impl Ack {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            acknowledged: false,
        }
    }
}

/// Limits enforced by the registry and its sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckLimits {
    /// Maximum number of live sessions in the process.
    pub max_channels: usize,
    /// Maximum number of live acks per channel.
    pub max_ack_value: usize,
    pub max_ack_age: Duration,
    pub max_session_age: Duration,
}

impl Default for AckLimits {
    fn default() -> Self {
        Self {
            max_channels: 1_000_000,
            max_ack_value: 1_000_000,
            max_ack_age: Duration::from_millis(20_000),
            max_session_age: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackedAck {
    pub(crate) ack: Ack,
    pub(crate) registered_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub(crate) next_ack_value: u64,
    pub(crate) acks: HashMap<u64, TrackedAck>,
}

/// Ack statuses in the order they were requested.
///
/// Serialises as a JSON object keyed by the id rendered as a string, e.g.
/// `{"1":true,"3":false}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckStatuses {
    entries: Vec<(i64, bool)>,
    positions: HashMap<i64, usize>,
}

impl AckStatuses {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    /// Records a status. A repeated id keeps its first position and takes the latest status.
    pub(crate) fn insert(&mut self, id: i64, acknowledged: bool) {
        match self.positions.get(&id) {
            Some(&position) => self.entries[position].1 = acknowledged,
            None => {
                self.positions.insert(id, self.entries.len());
                self.entries.push((id, acknowledged));
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<bool> {
        self.positions
            .get(&id)
            .map(|&position| self.entries[position].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, bool)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for AckStatuses {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, acknowledged) in &self.entries {
            map.serialize_entry(&id.to_string(), acknowledged)?;
        }
        map.end()
    }
}
