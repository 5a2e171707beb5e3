// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

use crate::ack::{Ack, AckLimits, AckStatuses, Channel, TrackedAck};
use crate::clock::{Clock, SystemClock};
use crate::errors::{AckError, Capacity};

// Registry state never holds a partially applied update across a panic, so a poisoned lock
// still guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Session {
    channels: Mutex<HashMap<String, Arc<Mutex<Channel>>>>,
    last_access: Mutex<Instant>,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: Instant) {
        *lock(&self.last_access) = now;
    }

    fn idle_since(&self) -> Instant {
        *lock(&self.last_access)
    }

    fn channel(&self, name: &str) -> Option<Arc<Mutex<Channel>>> {
        lock(&self.channels).get(name).cloned()
    }

    fn channel_or_create(&self, name: &str) -> Arc<Mutex<Channel>> {
        let mut channels = lock(&self.channels);
        Arc::clone(channels.entry(name.to_string()).or_default())
    }
}

/// Number of entries removed by one [`AckManager::sweep`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub acks: usize,
}

/// Process wide registry of sessions, channels and acks.
///
/// Locks are taken in the order sessions map, session channel map, channel. Each channel has its
/// own lock, so operations on different channels never wait on each other, and no lock is held
/// across I/O.
pub struct AckManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    limits: AckLimits,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AckManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckManager")
            .field("sessions", &self.session_count())
            .field("limits", &self.limits)
            .finish()
    }
}

impl AckManager {
    pub fn new(limits: AckLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: AckLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> &AckLimits {
        &self.limits
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Creates the session for `token` if needed and refreshes its last access time.
    ///
    /// Fails with [`AckError::ServerBusy`] when a new session would exceed `max_channels`.
    pub fn ensure_session(&self, token: &str) -> Result<(), AckError> {
        self.session_or_create(token).map(|_| ())
    }

    /// Creates the session and channel if needed and refreshes the session.
    pub fn ensure_channel(&self, token: &str, channel: &str) -> Result<(), AckError> {
        self.channel_or_create(token, channel).map(|_| ())
    }

    /// Returns the channel's next ack id and advances its counter.
    pub fn next_ack_id(&self, token: &str, channel: &str) -> Result<u64, AckError> {
        let channel = self.channel_or_create(token, channel)?;
        let mut channel = lock(&channel);
        let id = channel.next_ack_value;
        channel.next_ack_value += 1;
        Ok(id)
    }

    /// Starts tracking `id` as unacknowledged.
    ///
    /// Fails with [`AckError::ServerBusy`] when the channel already holds `max_ack_value` live
    /// acks.
    pub fn register_ack(&self, token: &str, channel: &str, id: u64) -> Result<(), AckError> {
        let now = self.clock.now();
        let channel = self.channel_or_create(token, channel)?;
        let mut channel = lock(&channel);
        if !channel.acks.contains_key(&id) && channel.acks.len() >= self.limits.max_ack_value {
            return Err(AckError::ServerBusy {
                capacity: Capacity::Acks,
                limit: self.limits.max_ack_value,
            });
        }
        channel.acks.insert(
            id,
            TrackedAck {
                ack: Ack::new(id),
                registered_at: now,
            },
        );
        Ok(())
    }

    /// Flags `id` as committed downstream. Returns `false` if the id is not tracked, which is not
    /// an error: it may already have been reported or expired.
    pub fn mark_acknowledged(&self, token: &str, channel: &str, id: u64) -> bool {
        let Some(channel) = self.existing_channel(token, channel) else {
            return false;
        };
        let mut channel = lock(&channel);
        match channel.acks.get_mut(&id) {
            Some(tracked) => {
                tracked.ack.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn is_acknowledged(&self, token: &str, channel: &str, id: u64) -> bool {
        self.existing_channel(token, channel)
            .and_then(|channel| lock(&channel).acks.get(&id).map(|t| t.ack.acknowledged))
            .unwrap_or(false)
    }

    /// Answers an ack status query of the form `{"acks": [1, 3, 4]}`.
    ///
    /// Every requested id is removed from the channel once its status has been read, whatever
    /// that status was, so each id is reported `true` at most once and its slot is reclaimed.
    ///
    /// A request without an `acks` array yields no statuses. A non-integer element fails the
    /// whole request before anything is consumed.
    pub fn report_and_consume(
        &self,
        token: &str,
        channel: &str,
        request: &Value,
    ) -> Result<AckStatuses, AckError> {
        let Some(Value::Array(items)) = request.get("acks") else {
            return Ok(AckStatuses::default());
        };
        let ids = items
            .iter()
            .map(|item| item.as_i64().ok_or_else(|| AckError::InvalidAckId(item.to_string())))
            .collect::<Result<Vec<i64>, AckError>>()?;

        let session = self.existing_session(token).ok_or(AckError::SessionNotFound)?;
        let channel = session.channel(channel).ok_or(AckError::ChannelNotFound)?;

        let mut statuses = AckStatuses::with_capacity(ids.len());
        let mut channel = lock(&channel);
        for id in ids {
            let acknowledged = u64::try_from(id)
                .ok()
                .and_then(|id| channel.acks.remove(&id))
                .is_some_and(|tracked| tracked.ack.acknowledged);
            statuses.insert(id, acknowledged);
        }
        Ok(statuses)
    }

    pub fn delete_ack(&self, token: &str, channel: &str, id: u64) -> bool {
        self.existing_channel(token, channel)
            .is_some_and(|channel| lock(&channel).acks.remove(&id).is_some())
    }

    /// Snapshot of the channel's live acks. Empty if the channel is unknown.
    pub fn list_acks(&self, token: &str, channel: &str) -> HashMap<u64, Ack> {
        self.existing_channel(token, channel)
            .map(|channel| {
                lock(&channel)
                    .acks
                    .iter()
                    .map(|(id, tracked)| (*id, tracked.ack))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ack_count(&self, token: &str, channel: &str) -> usize {
        self.existing_channel(token, channel)
            .map(|channel| lock(&channel).acks.len())
            .unwrap_or(0)
    }

    /// Evicts sessions idle longer than `max_session_age` and acks older than `max_ack_age`.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let survivors: Vec<Arc<Session>> = {
            let mut sessions = lock(&self.sessions);
            let before = sessions.len();
            sessions.retain(|_, session| {
                now.saturating_duration_since(session.idle_since()) <= self.limits.max_session_age
            });
            report.sessions = before - sessions.len();
            sessions.values().cloned().collect()
        };

        for session in survivors {
            let channels: Vec<Arc<Mutex<Channel>>> =
                lock(&session.channels).values().cloned().collect();
            for channel in channels {
                let mut channel = lock(&channel);
                let before = channel.acks.len();
                channel.acks.retain(|_, tracked| {
                    now.saturating_duration_since(tracked.registered_at) <= self.limits.max_ack_age
                });
                report.acks += before - channel.acks.len();
            }
        }

        if report != SweepReport::default() {
            debug!(
                "Swept {} idle sessions and {} expired acks",
                report.sessions, report.acks
            );
        }
        report
    }

    fn session_or_create(&self, token: &str) -> Result<Arc<Session>, AckError> {
        let now = self.clock.now();
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(token) {
            session.touch(now);
            return Ok(Arc::clone(session));
        }
        if sessions.len() >= self.limits.max_channels {
            return Err(AckError::ServerBusy {
                capacity: Capacity::Sessions,
                limit: self.limits.max_channels,
            });
        }
        debug!("Creating session, {} sessions live", sessions.len() + 1);
        let session = Arc::new(Session::new(now));
        sessions.insert(token.to_string(), Arc::clone(&session));
        Ok(session)
    }

    fn channel_or_create(&self, token: &str, channel: &str) -> Result<Arc<Mutex<Channel>>, AckError> {
        Ok(self.session_or_create(token)?.channel_or_create(channel))
    }

    fn existing_session(&self, token: &str) -> Option<Arc<Session>> {
        let session = lock(&self.sessions).get(token).cloned()?;
        session.touch(self.clock.now());
        Some(session)
    }

    fn existing_channel(&self, token: &str, channel: &str) -> Option<Arc<Mutex<Channel>>> {
        self.existing_session(token)?.channel(channel)
    }
}
