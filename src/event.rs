//! Input types delivered by the host
//!
//! An [`Event`] is one `(time, tag, record)` triple. Hosts usually hand
//! events over as a [`Chunk`]: a tag plus an ordered list of timed records
//! that is written atomically.

use crate::error::{EncodingError, EncodingResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Structured log payload
///
/// `serde_json::Value` cannot hold non-finite floats or cycles, so every
/// `Record` is JSON-representable by construction.
pub type Record = serde_json::Value;

/// Convert any serializable host value into a [`Record`]
///
/// Fails for values JSON cannot express: NaN and infinities, which
/// `serde_json` would otherwise turn into `null`, and maps with non-string
/// keys.
pub fn record_from<T: Serialize + ?Sized>(value: &T) -> EncodingResult<Record> {
    if let Err(finite::CheckError::NonFinite(v)) = value.serialize(finite::FiniteCheck) {
        return Err(EncodingError::NonFiniteFloat(v));
    }
    Ok(serde_json::to_value(value)?)
}

/// Serializer that only looks for non-finite floats
///
/// Any other failure is left for `serde_json` to report.
mod finite {
    use serde::ser::{self, Serialize};
    use std::fmt;

    #[derive(Debug)]
    pub(super) enum CheckError {
        NonFinite(f64),
        Custom(String),
    }

    impl fmt::Display for CheckError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                CheckError::NonFinite(v) => write!(f, "non-finite float {}", v),
                CheckError::Custom(msg) => f.write_str(msg),
            }
        }
    }

    impl std::error::Error for CheckError {}

    impl ser::Error for CheckError {
        fn custom<T: fmt::Display>(msg: T) -> Self {
            CheckError::Custom(msg.to_string())
        }
    }

    type Checked = Result<(), CheckError>;

    pub(super) struct FiniteCheck;

    impl ser::Serializer for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        type SerializeSeq = Self;
        type SerializeTuple = Self;
        type SerializeTupleStruct = Self;
        type SerializeTupleVariant = Self;
        type SerializeMap = Self;
        type SerializeStruct = Self;
        type SerializeStructVariant = Self;

        fn serialize_bool(self, _: bool) -> Checked {
            Ok(())
        }
        fn serialize_i8(self, _: i8) -> Checked {
            Ok(())
        }
        fn serialize_i16(self, _: i16) -> Checked {
            Ok(())
        }
        fn serialize_i32(self, _: i32) -> Checked {
            Ok(())
        }
        fn serialize_i64(self, _: i64) -> Checked {
            Ok(())
        }
        fn serialize_i128(self, _: i128) -> Checked {
            Ok(())
        }
        fn serialize_u8(self, _: u8) -> Checked {
            Ok(())
        }
        fn serialize_u16(self, _: u16) -> Checked {
            Ok(())
        }
        fn serialize_u32(self, _: u32) -> Checked {
            Ok(())
        }
        fn serialize_u64(self, _: u64) -> Checked {
            Ok(())
        }
        fn serialize_u128(self, _: u128) -> Checked {
            Ok(())
        }

        fn serialize_f32(self, v: f32) -> Checked {
            self.serialize_f64(f64::from(v))
        }

        fn serialize_f64(self, v: f64) -> Checked {
            if v.is_finite() {
                Ok(())
            } else {
                Err(CheckError::NonFinite(v))
            }
        }

        fn serialize_char(self, _: char) -> Checked {
            Ok(())
        }
        fn serialize_str(self, _: &str) -> Checked {
            Ok(())
        }
        fn serialize_bytes(self, _: &[u8]) -> Checked {
            Ok(())
        }
        fn serialize_none(self) -> Checked {
            Ok(())
        }

        fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Checked {
            value.serialize(self)
        }

        fn serialize_unit(self) -> Checked {
            Ok(())
        }
        fn serialize_unit_struct(self, _: &'static str) -> Checked {
            Ok(())
        }
        fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Checked {
            Ok(())
        }

        fn serialize_newtype_struct<T: ?Sized + Serialize>(
            self,
            _: &'static str,
            value: &T,
        ) -> Checked {
            value.serialize(self)
        }

        fn serialize_newtype_variant<T: ?Sized + Serialize>(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            value: &T,
        ) -> Checked {
            value.serialize(self)
        }

        fn serialize_seq(self, _: Option<usize>) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_tuple(self, _: usize) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_tuple_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_map(self, _: Option<usize>) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, CheckError> {
            Ok(self)
        }
        fn serialize_struct_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self, CheckError> {
            Ok(self)
        }
    }

    impl ser::SerializeSeq for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTuple for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTupleStruct for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTupleVariant for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeMap for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Checked {
            key.serialize(FiniteCheck)
        }
        fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeStruct for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeStructVariant for FiniteCheck {
        type Ok = ();
        type Error = CheckError;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Checked {
            value.serialize(FiniteCheck)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }
}

/// Event timestamp: whole seconds since the Unix epoch plus a nanosecond remainder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    secs: i64,
    nanos: u32,
}

impl EventTime {
    /// Create a timestamp, rejecting a remainder of one second or more
    pub fn new(secs: i64, nanos: u32) -> EncodingResult<Self> {
        if nanos >= 1_000_000_000 {
            return Err(EncodingError::InvalidNanos(nanos));
        }
        Ok(Self { secs, nanos })
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Utc::now().into()
    }

    /// Parse an RFC 3339 timestamp such as `2025-01-01T00:00:00.123456789Z`
    pub fn parse_rfc3339(input: &str) -> EncodingResult<Self> {
        DateTime::parse_from_rfc3339(input)
            .map(|dt| dt.with_timezone(&Utc).into())
            .map_err(|e| EncodingError::InvalidTimestamp {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Whole seconds since the Unix epoch
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Nanosecond remainder
    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Convert to a UTC datetime
    pub fn to_datetime(&self) -> EncodingResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.secs, self.nanos).ok_or(
            EncodingError::TimestampOutOfRange {
                secs: self.secs,
                nanos: self.nanos,
            },
        )
    }
}

impl From<DateTime<Utc>> for EventTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            secs: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() % 1_000_000_000,
        }
    }
}

/// A single log event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: EventTime,
    pub tag: String,
    pub record: Record,
}

impl Event {
    pub fn new(time: EventTime, tag: impl Into<String>, record: Record) -> Self {
        Self {
            time,
            tag: tag.into(),
            record,
        }
    }
}

/// Host-delivered unit of events sharing one tag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    /// Tag shared by every event in the chunk
    pub tag: String,

    /// Timed records in arrival order
    pub entries: Vec<(EventTime, Record)>,
}

impl Chunk {
    /// Create an empty chunk for a tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            entries: Vec::new(),
        }
    }

    /// Append a timed record
    pub fn push(&mut self, time: EventTime, record: Record) {
        self.entries.push((time, record));
    }

    /// Builder-style append
    pub fn with(mut self, time: EventTime, record: Record) -> Self {
        self.push(time, record);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Event> for Chunk {
    fn from(event: Event) -> Self {
        Self {
            tag: event.tag,
            entries: vec![(event.time, event.record)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_event_time_rejects_full_second() {
        assert!(EventTime::new(0, 999_999_999).is_ok());
        assert!(matches!(
            EventTime::new(0, 1_000_000_000),
            Err(EncodingError::InvalidNanos(1_000_000_000))
        ));
    }

    #[test]
    fn test_parse_rfc3339_keeps_nanos() {
        let t = EventTime::parse_rfc3339("2025-01-01T00:00:00.123456789Z").unwrap();
        assert_eq!(t.secs(), 1_735_689_600);
        assert_eq!(t.nanos(), 123_456_789);

        let offset = EventTime::parse_rfc3339("2025-01-01T02:00:00.5+02:00").unwrap();
        assert_eq!(offset.secs(), 1_735_689_600);
        assert_eq!(offset.nanos(), 500_000_000);

        assert!(EventTime::parse_rfc3339("yesterday").is_err());
    }

    #[test]
    fn test_out_of_range_datetime() {
        let t = EventTime::new(i64::MAX, 0).unwrap();
        assert!(matches!(
            t.to_datetime(),
            Err(EncodingError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_record_from_struct() {
        #[derive(Serialize)]
        struct Login {
            user: &'static str,
            attempts: u32,
        }

        let record = record_from(&Login {
            user: "alice",
            attempts: 3,
        })
        .unwrap();
        assert_eq!(record, json!({"user": "alice", "attempts": 3}));
    }

    #[test]
    fn test_record_from_rejects_non_string_keys() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        assert!(matches!(record_from(&map), Err(EncodingError::Json(_))));
    }

    #[test]
    fn test_record_from_rejects_non_finite_floats() {
        let nan = BTreeMap::from([("latency", f64::NAN)]);
        assert!(matches!(record_from(&nan), Err(EncodingError::NonFiniteFloat(v)) if v.is_nan()));

        #[derive(Serialize)]
        struct Sample {
            host: &'static str,
            readings: Vec<Option<f32>>,
        }
        let nested = Sample {
            host: "db1",
            readings: vec![Some(1.5), None, Some(f32::NEG_INFINITY)],
        };
        assert!(matches!(
            record_from(&nested),
            Err(EncodingError::NonFiniteFloat(v)) if v == f64::NEG_INFINITY
        ));

        let finite = BTreeMap::from([("latency", 0.25f64)]);
        assert_eq!(record_from(&finite).unwrap(), json!({"latency": 0.25}));
    }

    #[test]
    fn test_chunk_builder() {
        let chunk = Chunk::new("svc")
            .with(EventTime::new(1, 0).unwrap(), json!({"a": 1}))
            .with(EventTime::new(2, 0).unwrap(), json!({"a": 2}));
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.tag, "svc");

        let single: Chunk = Event::new(EventTime::new(3, 0).unwrap(), "one", json!(null)).into();
        assert_eq!(single.len(), 1);
        assert_eq!(single.tag, "one");
    }
}
