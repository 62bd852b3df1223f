//! Structured events emitted by the pool, and the reporter interface the
//! engine logs through.
//!
//! The engine never owns a logger; it consumes a [`Reporter`] handed in by
//! the embedder. Progress events are delivered separately to registered
//! [`EventSink`]s, which must be side-effect-free with respect to engine
//! state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ErrorKind;

/// Logging interface consumed by the engine.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    fn debug(&mut self, _msg: &str) {}
}

/// Reporter that drops everything. Used by tests and embedders that only
/// consume events.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Progress event for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PoolEvent {
    #[serde(rename = "execution:started")]
    ExecutionStarted { total_packages: usize },
    #[serde(rename = "execution:completed")]
    ExecutionCompleted {
        success: bool,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    #[serde(rename = "package:started")]
    PackageStarted { name: String },
    #[serde(rename = "package:completed")]
    PackageCompleted { name: String, duration_ms: u64 },
    #[serde(rename = "package:skipped-no-changes")]
    PackageSkippedNoChanges { name: String, reason: String },
    #[serde(rename = "package:failed")]
    PackageFailed {
        name: String,
        message: String,
        classification: ErrorKind,
    },
    #[serde(rename = "package:retrying")]
    PackageRetrying { name: String, attempt: u32 },
    #[serde(rename = "package:skipped")]
    PackageSkipped { name: String, reason: String },
    #[serde(rename = "checkpoint:saved")]
    CheckpointSaved { timestamp: DateTime<Utc> },
}

/// Subscriber interface for [`PoolEvent`]s.
pub trait EventSink {
    fn on_event(&mut self, event: &PoolEvent);
}

/// Sink that records every event in memory, mostly useful for tests and
/// post-run reporting.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<PoolEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_events(&self) -> &[PoolEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Events concerning a single package, by name.
    pub fn events_for_package(&self, name: &str) -> Vec<&PoolEvent> {
        self.events
            .iter()
            .filter(|e| match e {
                PoolEvent::PackageStarted { name: n }
                | PoolEvent::PackageCompleted { name: n, .. }
                | PoolEvent::PackageSkippedNoChanges { name: n, .. }
                | PoolEvent::PackageFailed { name: n, .. }
                | PoolEvent::PackageRetrying { name: n, .. }
                | PoolEvent::PackageSkipped { name: n, .. } => n == name,
                _ => false,
            })
            .collect()
    }
}

impl EventSink for EventLog {
    fn on_event(&mut self, event: &PoolEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_records_and_filters() {
        let mut log = EventLog::new();
        log.on_event(&PoolEvent::PackageStarted { name: "a".to_string() });
        log.on_event(&PoolEvent::PackageStarted { name: "b".to_string() });
        log.on_event(&PoolEvent::PackageCompleted {
            name: "a".to_string(),
            duration_ms: 12,
        });

        assert_eq!(log.len(), 3);
        assert_eq!(log.events_for_package("a").len(), 2);
        assert_eq!(log.events_for_package("b").len(), 1);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn events_serialize_with_colon_tags() {
        let json = serde_json::to_string(&PoolEvent::PackageSkippedNoChanges {
            name: "widgets".to_string(),
            reason: "no-changes".to_string(),
        })
        .expect("serialize");
        assert!(json.contains("\"type\":\"package:skipped-no-changes\""));

        let back: PoolEvent = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(back, PoolEvent::PackageSkippedNoChanges { .. }));
    }

    #[test]
    fn execution_events_round_trip() {
        for event in [
            PoolEvent::ExecutionStarted { total_packages: 3 },
            PoolEvent::ExecutionCompleted {
                success: false,
                completed: 1,
                failed: 1,
                skipped: 1,
            },
            PoolEvent::PackageFailed {
                name: "a".to_string(),
                message: "boom".to_string(),
                classification: ErrorKind::BuildError,
            },
            PoolEvent::CheckpointSaved { timestamp: Utc::now() },
        ] {
            let json = serde_json::to_string(&event).expect("serialize");
            let back: PoolEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, event);
        }
    }
}
