//! Analyzer call types exchanged between dispatcher and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Soft, cooperative time budget for one analyzer call.
///
/// Absolute wall-clock time so it survives the trip to a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deadline(DateTime<Utc>);

impl Deadline {
    /// Deadline `offset` from now.
    pub fn after(offset: Duration) -> Self {
        let delta = chrono::Duration::from_std(offset)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Self(Utc::now() + delta)
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// A deadline far enough out to never matter.
    pub fn none() -> Self {
        Self(Utc::now() + chrono::Duration::days(365 * 100))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.0
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Options forwarded unchanged to every analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerOptions {
    /// Upper bound on bytes a content analyzer reads from one file.
    pub max_bytes: u64,
    /// Include matched text in license matches.
    pub license_text: bool,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            max_bytes: defaults::DEFAULT_MAX_ANALYZED_BYTES,
            license_text: true,
        }
    }
}

/// One analyzer invocation against one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerCall {
    /// Registered analyzer name (e.g. `licenses`).
    pub analyzer: String,
    pub location: PathBuf,
    pub deadline: Deadline,
    #[serde(default)]
    pub options: AnalyzerOptions,
}

/// Why a worker could not produce a mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    Analyzer,
    UnknownAnalyzer,
}

/// Payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub analyzer: String,
    pub message: String,
    #[serde(default)]
    pub kind: FailureKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_is_in_future() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() > Duration::from_secs(8));
    }

    #[test]
    fn test_expired_deadline_has_no_time_left() {
        let deadline = Deadline::at(Utc::now() - chrono::Duration::seconds(5));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_later_deadlines_order_after_earlier() {
        let first = Deadline::after(Duration::from_secs(1));
        let second = Deadline::after(Duration::from_secs(2));
        assert!(first < second);
        assert!(second < Deadline::none());
    }

    #[test]
    fn test_call_defaults_options() {
        let json = r#"{"analyzer":"licenses","location":"/tmp/x","deadline":"2030-01-01T00:00:00Z"}"#;
        let call: AnalyzerCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.options, AnalyzerOptions::default());
        assert_eq!(call.analyzer, "licenses");
    }
}
