// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitoring records carried in ingestion datagrams.
//!
//! A datagram holds newline separated records. A record is either a JSON
//! batch of [`MonitorSample`]s or a free-text tag line of the form
//! `<timestamp> <source-tag> <message>`.

use serde::{Deserialize, Serialize};

use crate::errors::MonitorError;

/// Per-request performance sample reported by a workload instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSample {
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "CumulativeTime")]
    pub cumulative_time: f64,
    #[serde(rename = "AverageTime")]
    pub average_time: f64,
    #[serde(rename = "MaxTime")]
    pub max_time: f64,
    #[serde(rename = "Count")]
    pub count: u64,
    #[serde(rename = "AbnormalCount")]
    pub abnormal_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTag {
    pub timestamp: String,
    pub source: String,
    pub message: String,
}

impl SourceTag {
    /// Splits a tag line on the first two spaces. Missing parts are empty.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.splitn(3, ' ');
        let mut next = || parts.next().unwrap_or_default().to_string();
        Self {
            timestamp: next(),
            source: next(),
            message: next(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorRecord {
    Batch(Vec<MonitorSample>),
    Tag(SourceTag),
}

/// Splits a datagram payload into its non-empty records.
pub fn split_records(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload
        .split(|b| *b == b'\n')
        .filter(|record| !record.is_empty())
}

/// Classifies one record.
///
/// Records opening with `[` or `{` must be valid JSON: an array is a batch and
/// a lone object is a batch of one. Anything else is a tag line.
pub fn parse_record(record: &[u8]) -> Result<MonitorRecord, MonitorError> {
    match record.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'[') => Ok(MonitorRecord::Batch(serde_json::from_slice(record)?)),
        Some(b'{') => {
            let sample: MonitorSample = serde_json::from_slice(record)?;
            Ok(MonitorRecord::Batch(vec![sample]))
        }
        _ => Ok(MonitorRecord::Tag(SourceTag::parse(
            &String::from_utf8_lossy(record),
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_BATCH: &str = r#"[{"ServiceID":"test","Port":"5000","MessageType":"http","Key":"/test","CumulativeTime":0.1,"AverageTime":0.1,"MaxTime":0.1,"Count":1,"AbnormalCount":0}]"#;

    #[test]
    fn test_parse_batch() {
        let record = parse_record(SAMPLE_BATCH.as_bytes()).unwrap();
        let MonitorRecord::Batch(samples) = record else {
            panic!("expected a batch");
        };
        assert_eq!(
            samples,
            vec![MonitorSample {
                service_id: "test".to_string(),
                port: "5000".to_string(),
                host_name: String::new(),
                message_type: "http".to_string(),
                key: "/test".to_string(),
                cumulative_time: 0.1,
                average_time: 0.1,
                max_time: 0.1,
                count: 1,
                abnormal_count: 0,
            }]
        );
    }

    #[test]
    fn test_parse_single_object_with_host() {
        let record = parse_record(
            br#"{"ServiceID":"s","Port":"80","HostName":"node-1","MessageType":"mysql","Key":"select","CumulativeTime":2.0,"AverageTime":1.0,"MaxTime":1.5,"Count":2,"AbnormalCount":1}"#,
        )
        .unwrap();
        let MonitorRecord::Batch(samples) = record else {
            panic!("expected a batch");
        };
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].host_name, "node-1");
        assert_eq!(samples[0].abnormal_count, 1);
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(matches!(
            parse_record(b"[{\"ServiceID\":"),
            Err(MonitorError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_parse_tag_line() {
        let record = parse_record(b"1718000000 nginx-access GET /index.html 200").unwrap();
        assert_eq!(
            record,
            MonitorRecord::Tag(SourceTag {
                timestamp: "1718000000".to_string(),
                source: "nginx-access".to_string(),
                message: "GET /index.html 200".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_short_tag_line() {
        let record = parse_record(b"1718000000").unwrap();
        assert_eq!(
            record,
            MonitorRecord::Tag(SourceTag {
                timestamp: "1718000000".to_string(),
                source: String::new(),
                message: String::new(),
            })
        );
    }

    #[test]
    fn test_split_records_skips_empty() {
        let payload = format!("1 tag hello\n\n{SAMPLE_BATCH}\n");
        let records: Vec<_> = split_records(payload.as_bytes()).collect();
        assert_eq!(records.len(), 2);
        assert!(split_records(b"").next().is_none());
        assert!(split_records(b"\n\n\n").next().is_none());
    }

    proptest! {
        #[test]
        fn split_records_counts_non_empty_lines(
            lines in proptest::collection::vec("[a-z ]{0,12}", 0..16)
        ) {
            let payload = lines.join("\n");
            let expected = lines.iter().filter(|l| !l.is_empty()).count();
            prop_assert_eq!(split_records(payload.as_bytes()).count(), expected);
        }
    }
}
