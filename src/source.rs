//! Sample sources feeding the ingest pipeline.
//!
//! A source answers one question per cycle: what is the latest sample for this
//! metric? [`serial::SerialFeed`] answers from frames read off a device link,
//! [`cloud::CloudFeedSource`] asks a remote telemetry feed.

pub mod cloud;
pub mod serial;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound, TimeZone, Utc};
use thiserror::Error;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed {metric} returned status {status}")]
    Status {
        metric: String,
        status: reqwest::StatusCode,
    },

    #[error("decode failed: {0}")]
    Decode(String),
}

/// When a sample was observed, as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedAt {
    Zoned(DateTime<FixedOffset>),
    /// The source gave no timezone; treated as UTC.
    Naive(NaiveDateTime),
}

impl ObservedAt {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let raw = raw.trim();
        if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self::Zoned(zoned));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(Self::Naive)
            .ok_or_else(|| SourceError::Decode(format!("invalid timestamp {raw:?}")))
    }

    /// The instant in UTC, truncated to microseconds so it compares equal to
    /// what a `timestamptz` column hands back.
    pub fn to_utc(self) -> DateTime<Utc> {
        let utc = match self {
            Self::Zoned(zoned) => zoned.with_timezone(&Utc),
            Self::Naive(naive) => Utc.from_utc_datetime(&naive),
        };
        utc.trunc_subsecs(6)
    }
}

impl From<DateTime<Utc>> for ObservedAt {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Zoned(value.fixed_offset())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub metric: String,
    pub value: f64,
    pub observed_at: ObservedAt,
}

impl RawSample {
    pub fn new(metric: impl Into<String>, value: f64, observed_at: impl Into<ObservedAt>) -> Self {
        Self {
            metric: metric.into(),
            value,
            observed_at: observed_at.into(),
        }
    }
}

pub(crate) fn parse_value(raw: &str) -> Result<f64, SourceError> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| SourceError::Decode(format!("non-numeric value {raw:?}")))?;
    if !value.is_finite() {
        return Err(SourceError::Decode(format!("non-finite value {raw:?}")));
    }
    Ok(value)
}

#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Latest sample for `metric`, or `None` when the source has nothing yet.
    async fn fetch_latest(&self, metric: &str) -> Result<Option<RawSample>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    Invalid(String),

    #[error("no device link is connected")]
    NotConnected,

    #[error("command queue is full")]
    Busy,
}

/// Forwards actuator commands (`1`, `0`, `blink`, ...) to the device side.
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: &str) -> Result<(), CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zulu_and_offset_timestamps() {
        let zulu = ObservedAt::parse("2025-03-01T10:00:00Z").expect("zulu");
        let offset = ObservedAt::parse("2025-03-01T17:00:00+07:00").expect("offset");
        assert_eq!(zulu.to_utc(), offset.to_utc());
    }

    #[test]
    fn naive_timestamps_are_assumed_utc() {
        let naive = ObservedAt::parse("2025-03-01T10:00:00.250").expect("naive");
        assert!(matches!(naive, ObservedAt::Naive(_)));
        assert_eq!(naive.to_utc().to_rfc3339(), "2025-03-01T10:00:00.250+00:00");
    }

    #[test]
    fn sub_microsecond_precision_is_truncated() {
        let at = ObservedAt::parse("2025-03-01T10:00:00.855294295Z").expect("nanos");
        assert_eq!(at.to_utc().timestamp_subsec_nanos(), 855_294_000);

        let naive = ObservedAt::parse("2025-03-01T10:00:00.000000999").expect("naive");
        assert_eq!(naive.to_utc().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(matches!(
            ObservedAt::parse("yesterday"),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn value_must_be_finite_number() {
        assert_eq!(parse_value(" 26.5 ").expect("value"), 26.5);
        assert!(parse_value("ON").is_err());
        assert!(parse_value("NaN").is_err());
    }
}
