//! Record encoding
//!
//! Turns one `(time, tag, record)` triple into the row that is stored:
//! tag, timestamp text, compact JSON text and, when dedupe is on, a
//! SHA-256 content hash over the other three fields.

use crate::error::{EncodingError, EncodingResult};
use crate::event::{Chunk, EventTime, Record};
use chrono::format::{Item, StrftimeItems};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Default timestamp layout: UTC with nine fractional digits
const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9fZ";

/// Separator between hashed fields; JSON text always escapes control characters
const HASH_SEPARATOR: &[u8] = b"\x1f";

/// A row ready for the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRow {
    pub tag: String,
    pub time: String,
    pub record: String,
    /// Present only when dedupe is enabled
    pub record_hash: Option<String>,
}

/// How timestamps are rendered to text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TimeFormat {
    /// `YYYY-MM-DD HH:MM:SS.NNNNNNNNNZ`
    #[default]
    Utc,

    /// chrono strftime string, rendered in UTC
    Strftime(String),
}

impl TimeFormat {
    /// Parse a strftime string, rejecting specifiers chrono cannot render
    pub fn strftime(format: &str) -> Option<Self> {
        if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
            return None;
        }
        Some(TimeFormat::Strftime(format.to_string()))
    }

    /// strftime pattern used for rendering
    pub fn pattern(&self) -> &str {
        match self {
            TimeFormat::Utc => DEFAULT_TIME_FORMAT,
            TimeFormat::Strftime(format) => format,
        }
    }
}

/// Render a timestamp without losing sub-second precision
pub fn encode_timestamp(time: EventTime, format: &TimeFormat) -> EncodingResult<String> {
    let dt = time.to_datetime()?;
    let pattern = format.pattern();

    let mut out = String::with_capacity(32);
    write!(out, "{}", dt.format(pattern)).map_err(|_| EncodingError::Format {
        format: pattern.to_string(),
    })?;
    Ok(out)
}

/// Serialize a record to compact JSON text
pub fn encode_record(record: &Record) -> EncodingResult<String> {
    Ok(serde_json::to_string(record)?)
}

/// Hex-encoded SHA-256 over tag, timestamp text and JSON text
pub fn compute_record_hash(tag: &str, time: &str, record: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(HASH_SEPARATOR);
    hasher.update(time.as_bytes());
    hasher.update(HASH_SEPARATOR);
    hasher.update(record.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encoder configured once per sink
#[derive(Debug, Clone, Default)]
pub struct RecordEncoder {
    time_format: TimeFormat,
    dedupe: bool,
}

impl RecordEncoder {
    pub fn new(time_format: TimeFormat, dedupe: bool) -> Self {
        Self { time_format, dedupe }
    }

    /// Encode one event
    pub fn encode(&self, time: EventTime, tag: &str, record: &Record) -> EncodingResult<EncodedRow> {
        let time = encode_timestamp(time, &self.time_format)?;
        let record = encode_record(record)?;
        let record_hash = self
            .dedupe
            .then(|| compute_record_hash(tag, &time, &record));

        Ok(EncodedRow {
            tag: tag.to_string(),
            time,
            record,
            record_hash,
        })
    }

    /// Encode a whole chunk, or nothing at all
    pub fn encode_chunk(&self, chunk: &Chunk) -> EncodingResult<Vec<EncodedRow>> {
        chunk
            .entries
            .iter()
            .map(|(time, record)| self.encode(*time, &chunk.tag, record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_time() -> EventTime {
        EventTime::parse_rfc3339("2025-01-01T00:00:00.123456789Z").unwrap()
    }

    #[test]
    fn test_default_timestamp_keeps_nanos() {
        let text = encode_timestamp(scenario_time(), &TimeFormat::Utc).unwrap();
        assert_eq!(text, "2025-01-01 00:00:00.123456789Z");

        let whole = encode_timestamp(EventTime::new(0, 0).unwrap(), &TimeFormat::Utc).unwrap();
        assert_eq!(whole, "1970-01-01 00:00:00.000000000Z");
    }

    #[test]
    fn test_negative_seconds() {
        let t = EventTime::new(-1, 500_000_000).unwrap();
        let text = encode_timestamp(t, &TimeFormat::Utc).unwrap();
        assert_eq!(text, "1969-12-31 23:59:59.500000000Z");
    }

    #[test]
    fn test_custom_time_format() {
        let format = TimeFormat::strftime("%Y/%m/%d %H:%M:%S%.6f").unwrap();
        let text = encode_timestamp(scenario_time(), &format).unwrap();
        assert_eq!(text, "2025/01/01 00:00:00.123456");
    }

    #[test]
    fn test_invalid_time_format() {
        assert!(TimeFormat::strftime("%Y-%Q").is_none());
        assert!(TimeFormat::strftime("%Y-%m-%d").is_some());
    }

    #[test]
    fn test_out_of_range_timestamp() {
        let t = EventTime::new(i64::MAX, 0).unwrap();
        assert!(matches!(
            encode_timestamp(t, &TimeFormat::Utc),
            Err(EncodingError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_encode_record_compact() {
        let json = encode_record(&json!({"user": {"id": 123}, "tags": ["a", "b"]})).unwrap();
        assert!(!json.contains(' '));
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, json!({"user": {"id": 123}, "tags": ["a", "b"]}));
    }

    #[test]
    fn test_record_hash() {
        let hash = compute_record_hash("svc", "2025-01-01 00:00:00.000000000Z", "{}");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Same triple, same hash
        assert_eq!(
            hash,
            compute_record_hash("svc", "2025-01-01 00:00:00.000000000Z", "{}")
        );

        // Moving a character across a field boundary changes the hash
        assert_ne!(
            compute_record_hash("ab", "c", "{}"),
            compute_record_hash("a", "bc", "{}")
        );
    }

    #[test]
    fn test_encoder_dedupe_toggle() {
        let record = json!({"user": {"id": 123}});

        let plain = RecordEncoder::new(TimeFormat::Utc, false)
            .encode(scenario_time(), "svc", &record)
            .unwrap();
        assert_eq!(plain.tag, "svc");
        assert_eq!(plain.record, r#"{"user":{"id":123}}"#);
        assert!(plain.record_hash.is_none());

        let hashed = RecordEncoder::new(TimeFormat::Utc, true)
            .encode(scenario_time(), "svc", &record)
            .unwrap();
        assert_eq!(
            hashed.record_hash.as_deref(),
            Some(compute_record_hash("svc", &hashed.time, &hashed.record).as_str())
        );
    }

    #[test]
    fn test_encode_chunk_is_all_or_nothing() {
        let encoder = RecordEncoder::default();
        let good = Chunk::new("svc")
            .with(EventTime::new(1, 0).unwrap(), json!({"n": 1}))
            .with(EventTime::new(2, 0).unwrap(), json!({"n": 2}));
        let rows = encoder.encode_chunk(&good).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].record, r#"{"n":2}"#);

        let bad = good.with(EventTime::new(i64::MAX, 0).unwrap(), json!({"n": 3}));
        assert!(encoder.encode_chunk(&bad).is_err());
    }
}
