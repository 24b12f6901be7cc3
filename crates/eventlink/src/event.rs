// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// A single platform event delivered over the request/reply channel.
///
/// Events are immutable once built. Each call to [`Event::new`] yields a fresh
/// identifier, so retries of the same value are recognizable downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    message: String,
    #[serde(serialize_with = "serialize_rfc3339")]
    time: DateTime<Utc>,
}

fn serialize_rfc3339<S: Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, false))
}

impl Event {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_parts(Uuid::new_v4().to_string(), message, Utc::now())
    }

    pub fn with_parts(
        event_id: impl Into<String>,
        message: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            message: message.into(),
            time,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Encodes the event as the single JSON text message sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_json_shape() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let event = Event::with_parts("evt-1", "container started", time);
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"event_id":"evt-1","message":"container started","time":"2024-05-01T12:30:00+00:00"}"#
        );
    }

    #[test]
    fn test_event_parses_offset_time() {
        let event: Event = serde_json::from_str(
            r#"{"event_id":"a","message":"m","time":"2024-05-01T14:30:00+02:00"}"#,
        )
        .unwrap();
        assert_eq!(
            event.time(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::new("same");
        let b = Event::new("same");
        assert_ne!(a.event_id(), b.event_id());
        assert_eq!(a.message(), b.message());
    }
}
