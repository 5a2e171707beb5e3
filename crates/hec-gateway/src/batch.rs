// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};

use crate::errors::GatewayError;
use crate::time::{resolve_timestamp, ResolvedTime};

/// One event of an ingestion request, with its time already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HecEvent {
    pub event: String,
    pub host: Option<String>,
    pub source: Option<String>,
    pub sourcetype: Option<String>,
    pub index: Option<String>,
    pub time: ResolvedTime,
}

impl HecEvent {
    fn from_object(object: &Map<String, Value>, default_time: i64) -> Result<Self, GatewayError> {
        let event = match object.get("event") {
            None | Some(Value::Null) => return Err(GatewayError::EventFieldMissing),
            Some(Value::String(text)) if text.is_empty() => {
                return Err(GatewayError::EventFieldBlank)
            }
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        };

        Ok(Self {
            event,
            host: text_field(object, "host"),
            source: text_field(object, "source"),
            sourcetype: text_field(object, "sourcetype"),
            index: text_field(object, "index"),
            time: resolve_timestamp(object.get("time"), default_time),
        })
    }
}

fn text_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    object
        .get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Splits a request body into its events.
///
/// The body holds zero or more JSON objects, concatenated with or without whitespace between
/// them. Each event's time defaults to the previous event's resolved instant, the first one to
/// `default_time`. Any malformed object fails the whole batch.
pub fn parse_batch(body: &[u8], default_time: i64) -> Result<Vec<HecEvent>, GatewayError> {
    let mut events = Vec::new();
    let mut previous_time = default_time;

    for value in serde_json::Deserializer::from_slice(body).into_iter::<Value>() {
        let value = value.map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(GatewayError::InvalidJson(format!(
                "expected an event object, got {value}"
            )));
        };
        let event = HecEvent::from_object(&object, previous_time)?;
        previous_time = event.time.instant;
        events.push(event);
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeSource;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_single_event_keeps_metadata() {
        let body = br#"{"sourcetype": "mysourcetype", "event": "Hello, world!", "host": "localhost", "source": "mysource", "index": "myindex", "time": 123456}"#;
        let events = parse_batch(body, NOW).unwrap();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.event, "Hello, world!");
        assert_eq!(event.host.as_deref(), Some("localhost"));
        assert_eq!(event.source.as_deref(), Some("mysource"));
        assert_eq!(event.sourcetype.as_deref(), Some("mysourcetype"));
        assert_eq!(event.index.as_deref(), Some("myindex"));
        assert_eq!(event.time.instant, 123456);
        assert_eq!(event.time.source, TimeSource::Reported);
    }

    #[test]
    fn test_concatenated_objects_are_separate_events() {
        let body = br#"{"event": "Hello, world!", "host": "localhost", "time": 1277464192}{"event": "Hello, world!"}{"event": "Hello, world!", "time": 1277464192.1}{"event": "Hello, world!"}"#;
        let events = parse_batch(body, NOW).unwrap();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.event == "Hello, world!"));
    }

    #[test]
    fn test_whitespace_between_objects_is_allowed() {
        let body = b"{\"event\": \"a\"}\n {\"event\": \"b\"}\r\n\t{\"event\": \"c\"}  ";
        let events = parse_batch(body, NOW).unwrap();
        assert_eq!(
            events.iter().map(|e| e.event.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_missing_time_inherits_previous_event() {
        let body = br#"{"event": "1", "time": 1277464192}{"event": "2"}{"event": "3", "time": "junk"}{"event": "4", "time": 1277464200}{"event": "5"}"#;
        let events = parse_batch(body, NOW).unwrap();

        let times: Vec<(i64, TimeSource)> =
            events.iter().map(|e| (e.time.instant, e.time.source)).collect();
        assert_eq!(
            times,
            vec![
                (1277464192, TimeSource::Reported),
                (1277464192, TimeSource::Generated),
                (1277464192, TimeSource::Generated),
                (1277464200, TimeSource::Reported),
                (1277464200, TimeSource::Generated),
            ]
        );
    }

    #[test]
    fn test_first_event_defaults_to_now() {
        let events = parse_batch(br#"{"event": "x"}"#, NOW).unwrap();
        assert_eq!(events[0].time.instant, NOW);
        assert!(!events[0].time.parsed);
    }

    #[test]
    fn test_structured_event_is_compact_json() {
        let body = br#"{"sourcetype":"access", "event": {"message": "Access log test message 1"}}"#;
        let events = parse_batch(body, NOW).unwrap();
        assert_eq!(events[0].event, r#"{"message":"Access log test message 1"}"#);
    }

    #[test]
    fn test_missing_or_null_event_is_rejected() {
        let missing = br#"{"sourcetype": "mysourcetype", "host": "localhost"}"#;
        assert!(matches!(
            parse_batch(missing, NOW),
            Err(GatewayError::EventFieldMissing)
        ));

        let null = br#"{"sourcetype": "mysourcetype", "event": null}"#;
        assert!(matches!(
            parse_batch(null, NOW),
            Err(GatewayError::EventFieldMissing)
        ));
    }

    #[test]
    fn test_blank_event_is_rejected() {
        let body = br#"{"event": "ok"}{"event": ""}"#;
        assert!(matches!(
            parse_batch(body, NOW),
            Err(GatewayError::EventFieldBlank)
        ));
    }

    #[test]
    fn test_malformed_json_fails_the_batch() {
        let body = br#"{"sourcetype": "mysourcetype", "event": {{{{}}}}"#;
        assert!(matches!(
            parse_batch(body, NOW),
            Err(GatewayError::InvalidJson(_))
        ));

        assert!(matches!(
            parse_batch(br#"{"event": "a"} 42"#, NOW),
            Err(GatewayError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_empty_body_has_no_events() {
        assert!(parse_batch(b"", NOW).unwrap().is_empty());
        assert!(parse_batch(b"  \n", NOW).unwrap().is_empty());
    }
}
