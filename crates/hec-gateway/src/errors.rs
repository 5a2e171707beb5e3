// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the ack registry, the sender and the ingestion service.

use std::io;

/// Limit that rejected an admission in the ack registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Too many live sessions in the process (`max.channels`).
    Sessions,
    /// Too many live acks in one channel (`max.ack.value`).
    Acks,
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sessions => write!(f, "session"),
            Self::Acks => write!(f, "ack"),
        }
    }
}

/// Errors raised by [`crate::ack::AckManager`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("Server is busy: {capacity} limit of {limit} reached")]
    ServerBusy { capacity: Capacity, limit: usize },

    #[error("Session not found")]
    SessionNotFound,

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),
}

impl AckError {
    /// Capacity errors are backpressure, the client is expected to retry later.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::ServerBusy { .. })
    }
}

/// Failures of a single transport attempt. Absorbed by [`crate::sender::ReliableSender`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server closed the connection")]
    ServerClose,

    #[error("Not connected")]
    NotConnected,
}

/// Errors surfaced by the sender layer to its callers.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("Invalid connection type: {0}")]
    UnsupportedProtocol(String),

    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Sender is closed")]
    Closed,

    #[error("Sender pool needs at least one connection")]
    EmptyPool,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors of the ingestion service, each one mapped to its own HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Token is required")]
    AuthenticationTokenMissing,

    #[error("Data channel is missing")]
    ChannelNotProvided,

    #[error("No data")]
    NoData,

    #[error("Invalid data format: {0}")]
    InvalidJson(String),

    #[error("Event field is required")]
    EventFieldMissing,

    #[error("Event field cannot be blank")]
    EventFieldBlank,

    #[error(transparent)]
    Ack(#[from] AckError),

    #[error(transparent)]
    Sender(#[from] SenderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_protocol_names_the_value() {
        let error = SenderError::UnsupportedProtocol("notRelp".to_string());
        assert_eq!(error.to_string(), "Invalid connection type: notRelp");
    }

    #[test]
    fn test_busy_is_distinct_from_not_found() {
        let busy = AckError::ServerBusy {
            capacity: Capacity::Acks,
            limit: 2,
        };
        assert!(busy.is_busy());
        assert!(!AckError::SessionNotFound.is_busy());
        assert!(!AckError::ChannelNotFound.is_busy());
        assert_eq!(busy.to_string(), "Server is busy: ack limit of 2 reached");
    }

    #[test]
    fn test_gateway_error_wraps_ack_error() {
        let error: GatewayError = AckError::ChannelNotFound.into();
        assert_eq!(error.to_string(), "Channel not found");
        assert!(matches!(error, GatewayError::Ack(AckError::ChannelNotFound)));
    }
}
