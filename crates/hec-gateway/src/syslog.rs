// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RFC5424 rendering of accepted events.
//!
//! Every message is sent with facility `user` and severity `informational`, so the priority is
//! always `<14>`. Gateway metadata travels as structured data under the private enterprise number
//! 48577:
//!
//! ```text
//! <14>1 2024-03-01T12:00:00.000Z host app - - [hec_metadata@48577 channel="c" ack_id="0" time_source="reported" time_parsed="true" time="1426279439123" sourcetype="access"] event
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use hyper::http::HeaderMap;
use std::fmt::Write;

use crate::batch::HecEvent;

const PRIORITY: u8 = 14;
const VERSION: u8 = 1;
const NIL: &str = "-";
const METADATA_SD_ID: &str = "hec_metadata@48577";
const ORIGIN_SD_ID: &str = "hec_origin@48577";

/// Forwarding headers of the request that carried an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    pub x_forwarded_for: Option<String>,
    pub x_forwarded_host: Option<String>,
    pub x_forwarded_proto: Option<String>,
}

impl HeaderInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        };
        Self {
            x_forwarded_for: get("x-forwarded-for"),
            x_forwarded_host: get("x-forwarded-host"),
            x_forwarded_proto: get("x-forwarded-proto"),
        }
    }

    fn is_empty(&self) -> bool {
        self.x_forwarded_for.is_none()
            && self.x_forwarded_host.is_none()
            && self.x_forwarded_proto.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SyslogMessage<'a> {
    /// Header timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub hostname: &'a str,
    pub appname: &'a str,
    pub channel: &'a str,
    pub ack_id: Option<u64>,
    pub event: &'a HecEvent,
    pub headers: &'a HeaderInfo,
}

impl SyslogMessage<'_> {
    pub fn to_rfc5424(&self) -> String {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| NIL.to_string());

        let mut message = format!(
            "<{PRIORITY}>{VERSION} {timestamp} {} {} {NIL} {NIL} ",
            header_field(self.hostname),
            header_field(self.appname),
        );

        message.push('[');
        message.push_str(METADATA_SD_ID);
        push_param(&mut message, "channel", self.channel);
        if let Some(ack_id) = self.ack_id {
            push_param(&mut message, "ack_id", &ack_id.to_string());
        }
        let time = self.event.time;
        push_param(&mut message, "time_source", time.source.as_str());
        push_param(&mut message, "time_parsed", if time.parsed { "true" } else { "false" });
        push_param(&mut message, "time", &time.instant.to_string());
        let fields = [
            ("host", &self.event.host),
            ("source", &self.event.source),
            ("sourcetype", &self.event.sourcetype),
            ("index", &self.event.index),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                push_param(&mut message, name, value);
            }
        }
        message.push(']');

        if !self.headers.is_empty() {
            message.push('[');
            message.push_str(ORIGIN_SD_ID);
            let origin = [
                ("X-Forwarded-For", &self.headers.x_forwarded_for),
                ("X-Forwarded-Host", &self.headers.x_forwarded_host),
                ("X-Forwarded-Proto", &self.headers.x_forwarded_proto),
            ];
            for (name, value) in origin {
                if let Some(value) = value {
                    push_param(&mut message, name, value);
                }
            }
            message.push(']');
        }

        message.push(' ');
        message.push_str(&self.event.event);
        message
    }
}

/// Header fields are printable ASCII without spaces, or the nil value.
fn header_field(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_graphic())
        .collect();
    if cleaned.is_empty() {
        NIL.to_string()
    } else {
        cleaned
    }
}

fn push_param(message: &mut String, name: &str, value: &str) {
    let _ = write!(message, " {name}=\"");
    for c in value.chars() {
        if matches!(c, '"' | '\\' | ']') {
            message.push('\\');
        }
        message.push(c);
    }
    message.push('"');
}
