// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request orchestration: parse, track, format, deliver, acknowledge.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use crate::ack::{AckManager, AckStatuses, DEFAULT_CHANNEL};
use crate::batch::parse_batch;
use crate::errors::GatewayError;
use crate::sender::SenderPool;
use crate::syslog::{HeaderInfo, SyslogMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResponse {
    pub text: &'static str,
    pub code: u8,
    #[serde(rename = "ackID", skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    #[serde(rename = "ackIDs", skip_serializing_if = "Vec::is_empty")]
    pub ack_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckResponse {
    pub acks: AckStatuses,
}

pub struct HecService {
    manager: Arc<AckManager>,
    pool: Arc<SenderPool>,
    hostname: String,
    appname: String,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl HecService {
    pub fn new(
        manager: Arc<AckManager>,
        pool: Arc<SenderPool>,
        hostname: impl Into<String>,
        appname: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            pool,
            hostname: hostname.into(),
            appname: appname.into(),
        }
    }

    pub fn manager(&self) -> &Arc<AckManager> {
        &self.manager
    }

    /// Accepts a batch of events and returns once every event has been committed downstream.
    ///
    /// With a channel every event gets an ack id, acknowledged as soon as the batch is
    /// committed. Without one the session is only refreshed and no ids are issued.
    pub async fn send_events(
        &self,
        token: Option<&str>,
        channel: Option<&str>,
        body: &[u8],
        headers: &HeaderInfo,
    ) -> Result<SendResponse, GatewayError> {
        let token = non_blank(token).ok_or(GatewayError::AuthenticationTokenMissing)?;
        let now = chrono::Utc::now().timestamp_millis();
        let events = parse_batch(body, now)?;
        if events.is_empty() {
            return Err(GatewayError::NoData);
        }

        let tracked_channel = non_blank(channel);
        let ack_ids = match tracked_channel {
            Some(channel) => self.allocate_acks(token, channel, events.len())?,
            None => {
                self.manager.ensure_channel(token, DEFAULT_CHANNEL)?;
                Vec::new()
            }
        };
        let channel_name = tracked_channel.unwrap_or(DEFAULT_CHANNEL);

        let messages: Vec<String> = events
            .iter()
            .enumerate()
            .map(|(index, event)| {
                SyslogMessage {
                    timestamp: now,
                    hostname: &self.hostname,
                    appname: &self.appname,
                    channel: channel_name,
                    ack_id: ack_ids.get(index).copied(),
                    event,
                    headers,
                }
                .to_rfc5424()
            })
            .collect();

        if let Err(e) = self.pool.send(&messages).await {
            error!("Dropping batch of {} events: {e}", messages.len());
            self.release_acks(token, channel_name, &ack_ids);
            return Err(e.into());
        }

        for id in &ack_ids {
            self.manager.mark_acknowledged(token, channel_name, *id);
        }
        debug!(
            "Committed {} events on channel {channel_name}",
            messages.len()
        );

        Ok(SendResponse {
            text: "Success",
            code: 0,
            ack_id: ack_ids.first().copied(),
            ack_ids,
        })
    }

    /// Reports and consumes the statuses requested by an `{"acks": [...]}` body.
    pub fn get_acks(
        &self,
        token: Option<&str>,
        channel: Option<&str>,
        body: &[u8],
    ) -> Result<AckResponse, GatewayError> {
        let token = non_blank(token).ok_or(GatewayError::AuthenticationTokenMissing)?;
        let channel = non_blank(channel).ok_or(GatewayError::ChannelNotProvided)?;
        let request: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(body).map_err(|e| GatewayError::InvalidJson(e.to_string()))?
        };
        let acks = self.manager.report_and_consume(token, channel, &request)?;
        Ok(AckResponse { acks })
    }

    /// Issues and registers one id per event. On a capacity error the ids registered so far are
    /// released again.
    fn allocate_acks(
        &self,
        token: &str,
        channel: &str,
        count: usize,
    ) -> Result<Vec<u64>, GatewayError> {
        self.manager.ensure_channel(token, channel)?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let registered = self
                .manager
                .next_ack_id(token, channel)
                .and_then(|id| self.manager.register_ack(token, channel, id).map(|()| id));
            match registered {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.release_acks(token, channel, &ids);
                    return Err(e.into());
                }
            }
        }
        Ok(ids)
    }

    fn release_acks(&self, token: &str, channel: &str, ids: &[u64]) {
        for id in ids {
            self.manager.delete_ack(token, channel, *id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckLimits;
    use crate::errors::{AckError, SenderError};
    use crate::sender::pool::DynSender;
    use crate::sender::{Connection, MemoryConnection, MemoryRecorder, ReliableSender, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;

    const TOKEN: &str = "AUTH_TOKEN_11111";
    const CHANNEL: &str = "CHANNEL_11111";

    async fn service_with(
        limits: AckLimits,
        connection: MemoryConnection,
        policy: RetryPolicy,
    ) -> (HecService, MemoryRecorder) {
        let recorder = connection.recorder();
        let boxed: Box<dyn Connection> = Box::new(connection);
        let sender: DynSender = ReliableSender::connect(boxed, policy).await.unwrap();
        let pool = SenderPool::from_senders(vec![sender]).unwrap();
        let service = HecService::new(
            Arc::new(AckManager::new(limits)),
            Arc::new(pool),
            "localhost",
            "hec-gateway",
        );
        (service, recorder)
    }

    async fn service() -> (HecService, MemoryRecorder) {
        service_with(
            AckLimits::default(),
            MemoryConnection::new(),
            RetryPolicy::default(),
        )
        .await
    }

    fn body(events: usize) -> Vec<u8> {
        (0..events)
            .map(|i| format!(r#"{{"event": "Hello, world {i}!", "host": "localhost"}}"#))
            .collect::<String>()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_concatenated_events_get_consecutive_ack_ids() {
        let (service, recorder) = service().await;
        let response = service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(4), &HeaderInfo::default())
            .await
            .unwrap();

        assert_eq!(response.ack_ids, vec![0, 1, 2, 3]);
        assert_eq!(response.ack_id, Some(0));
        assert_eq!(recorder.delivered().len(), 4);
        assert!(recorder.delivered()[2].contains("ack_id=\"2\""));
        for id in 0..4 {
            assert!(service.manager().is_acknowledged(TOKEN, CHANNEL, id));
        }

        let second = service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(1), &HeaderInfo::default())
            .await
            .unwrap();
        assert_eq!(second.ack_id, Some(4));
    }

    #[tokio::test]
    async fn test_response_body() {
        let (service, _) = service().await;
        let response = service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(2), &HeaderInfo::default())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"text": "Success", "code": 0, "ackID": 0, "ackIDs": [0, 1]})
        );
    }

    #[tokio::test]
    async fn test_untracked_events_are_sent_without_ack_ids() {
        let (service, recorder) = service().await;
        let response = service
            .send_events(Some(TOKEN), None, &body(2), &HeaderInfo::default())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"text": "Success", "code": 0})
        );
        assert_eq!(recorder.delivered().len(), 2);
        assert!(recorder.delivered()[0].contains("channel=\"defaultchannel\""));
        assert!(!recorder.delivered()[0].contains("ack_id"));
        assert_eq!(service.manager().session_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let (service, recorder) = service().await;
        for token in [None, Some(""), Some("  ")] {
            let result = service
                .send_events(token, Some(CHANNEL), &body(1), &HeaderInfo::default())
                .await;
            assert!(matches!(result, Err(GatewayError::AuthenticationTokenMissing)));
        }
        assert!(matches!(
            service.get_acks(None, Some(CHANNEL), b"{}"),
            Err(GatewayError::AuthenticationTokenMissing)
        ));
        assert!(recorder.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_batch_sends_nothing() {
        let (service, recorder) = service().await;
        let body = br#"{"event": "ok"}{"event": {{{{}}}}"#;
        let result = service
            .send_events(Some(TOKEN), Some(CHANNEL), body, &HeaderInfo::default())
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidJson(_))));
        assert!(recorder.delivered().is_empty());
        assert_eq!(service.manager().ack_count(TOKEN, CHANNEL), 0);

        let result = service
            .send_events(Some(TOKEN), Some(CHANNEL), b"", &HeaderInfo::default())
            .await;
        assert!(matches!(result, Err(GatewayError::NoData)));
    }

    #[tokio::test]
    async fn test_ack_capacity_rejects_whole_batch() {
        let limits = AckLimits {
            max_ack_value: 3,
            ..AckLimits::default()
        };
        let (service, recorder) =
            service_with(limits, MemoryConnection::new(), RetryPolicy::default()).await;

        let result = service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(4), &HeaderInfo::default())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Ack(AckError::ServerBusy { .. }))
        ));
        assert!(recorder.delivered().is_empty());
        assert_eq!(service.manager().ack_count(TOKEN, CHANNEL), 0);

        service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(3), &HeaderInfo::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_sender_releases_acks() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            max_attempts: Some(1),
        };
        let (service, _) = service_with(
            AckLimits::default(),
            MemoryConnection::new().failing_commits(1),
            policy,
        )
        .await;

        let result = service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(1), &HeaderInfo::default())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Sender(SenderError::RetriesExhausted { .. }))
        ));
        assert_eq!(service.manager().ack_count(TOKEN, CHANNEL), 0);
    }

    #[tokio::test]
    async fn test_get_acks_is_one_shot() {
        let (service, _) = service().await;
        service
            .send_events(Some(TOKEN), Some(CHANNEL), &body(2), &HeaderInfo::default())
            .await
            .unwrap();

        let request = br#"{"acks": [1, 3, 4]}"#;
        let first = service.get_acks(Some(TOKEN), Some(CHANNEL), request).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            r#"{"acks":{"1":true,"3":false,"4":false}}"#
        );
        let second = service.get_acks(Some(TOKEN), Some(CHANNEL), request).unwrap();
        assert_eq!(
            serde_json::to_string(&second).unwrap(),
            r#"{"acks":{"1":false,"3":false,"4":false}}"#
        );
        // Id 0 was never queried and is still tracked.
        assert!(service.manager().is_acknowledged(TOKEN, CHANNEL, 0));
    }

    #[tokio::test]
    async fn test_get_acks_errors() {
        let (service, _) = service().await;
        assert!(matches!(
            service.get_acks(Some(TOKEN), None, b"{}"),
            Err(GatewayError::ChannelNotProvided)
        ));
        assert!(matches!(
            service.get_acks(Some(TOKEN), Some(CHANNEL), br#"{"acks": [1]}"#),
            Err(GatewayError::Ack(AckError::SessionNotFound))
        ));
        assert!(matches!(
            service.get_acks(Some(TOKEN), Some(CHANNEL), b"{not json"),
            Err(GatewayError::InvalidJson(_))
        ));

        service.manager().ensure_channel(TOKEN, CHANNEL).unwrap();
        assert!(matches!(
            service.get_acks(Some(TOKEN), Some("CHANNEL_22222"), br#"{"acks": [1]}"#),
            Err(GatewayError::Ack(AckError::ChannelNotFound))
        ));
        assert!(matches!(
            service.get_acks(Some(TOKEN), Some(CHANNEL), br#"{"acks": [1, "a"]}"#),
            Err(GatewayError::Ack(AckError::InvalidAckId(_)))
        ));
        let empty = service.get_acks(Some(TOKEN), Some(CHANNEL), b"").unwrap();
        assert!(empty.acks.is_empty());
    }
}
