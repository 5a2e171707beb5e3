// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP event collector gateway.
//!
//! Accepts batches of JSON events, tags each one with a delivery ack id, forwards them as
//! RFC5424 messages over RELP, and lets clients poll which ids the collector has committed.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod ack;
pub mod batch;
pub mod clock;
pub mod config;
pub mod errors;
pub mod http;
pub mod sender;
pub mod service;
pub mod syslog;
pub mod time;

pub use ack::{AckLimits, AckManager};
pub use config::GatewayConfig;
pub use errors::{AckError, GatewayError, SenderError};
pub use http::HecServer;
pub use sender::{ReliableSender, RetryPolicy, SenderPool};
pub use service::HecService;
