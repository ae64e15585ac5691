//! Sync progress reporting.
//!
//! The orchestrator emits [`ProgressEvent`]s at phase boundaries and per
//! batch. Observers receive them synchronously, in order:
//!
//! - [`crate::jobs::JobRecorder`] folds them into the pollable job record.
//! - [`StderrProgress`] / [`JsonProgress`] print them for `codesync sync`.
//!
//! CLI progress is written to **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

use serde::Serialize;

use crate::orchestrator::SyncReport;

/// Phase of the sync state machine.
///
/// ```text
/// Idle → Fetching → Diffing → Chunking → Embedding → Upserting → Complete
///              \________\__________\___________\___________\____→ Error
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Diffing,
    Chunking,
    Embedding,
    Upserting,
    Complete,
    Error,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Chunking => "chunking",
            SyncPhase::Embedding => "embedding",
            SyncPhase::Upserting => "upserting",
            SyncPhase::Complete => "complete",
            SyncPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Complete | SyncPhase::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            SyncPhase::Idle => 0,
            SyncPhase::Fetching => 1,
            SyncPhase::Diffing => 2,
            SyncPhase::Chunking => 3,
            SyncPhase::Embedding => 4,
            SyncPhase::Upserting => 5,
            SyncPhase::Complete => 6,
            SyncPhase::Error => 7,
        }
    }

    /// Phases only move forward; `Error` is reachable from any non-terminal phase.
    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// A single progress event for one sync run. `progress` is a percentage.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Phase {
        codebase_id: String,
        phase: SyncPhase,
        progress: u8,
        message: String,
    },
    Batch {
        codebase_id: String,
        phase: SyncPhase,
        progress: u8,
        done: u64,
        total: u64,
    },
    Warning {
        codebase_id: String,
        message: String,
    },
    Finished {
        codebase_id: String,
        report: SyncReport,
    },
    Failed {
        codebase_id: String,
        code: String,
        message: String,
    },
}

/// Receives progress events. Called from the sync task; must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: `sync acme-api  embedding  12 / 40 batches  (52%)`.
pub struct StderrProgress;

impl ProgressObserver for StderrProgress {
    fn on_event(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Phase {
                codebase_id,
                phase,
                progress,
                message,
            } => format!(
                "sync {}  {}  {}  ({}%)\n",
                codebase_id,
                phase.as_str(),
                message,
                progress
            ),
            ProgressEvent::Batch {
                codebase_id,
                phase,
                progress,
                done,
                total,
            } => format!(
                "sync {}  {}  {} / {}  ({}%)\n",
                codebase_id,
                phase.as_str(),
                format_number(*done),
                format_number(*total),
                progress
            ),
            ProgressEvent::Warning {
                codebase_id,
                message,
            } => format!("sync {}  warning: {}\n", codebase_id, message),
            ProgressEvent::Finished {
                codebase_id,
                report,
            } => format!(
                "sync {}  {}  {} files reindexed, {} deleted, {} chunks embedded\n",
                codebase_id,
                report.outcome.as_str(),
                format_number(report.counts.files_reindexed as u64),
                format_number(report.counts.files_deleted as u64),
                format_number(report.counts.chunks_embedded as u64)
            ),
            ProgressEvent::Failed {
                codebase_id,
                message,
                ..
            } => format!("sync {}  failed: {}\n", codebase_id, message),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressObserver for JsonProgress {
    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> std::sync::Arc<dyn ProgressObserver> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn phases_only_move_forward() {
        assert!(SyncPhase::Idle.can_transition_to(SyncPhase::Fetching));
        assert!(SyncPhase::Diffing.can_transition_to(SyncPhase::Complete));
        assert!(SyncPhase::Embedding.can_transition_to(SyncPhase::Error));
        assert!(!SyncPhase::Embedding.can_transition_to(SyncPhase::Chunking));
        assert!(!SyncPhase::Complete.can_transition_to(SyncPhase::Error));
        assert!(!SyncPhase::Error.can_transition_to(SyncPhase::Error));
    }

    #[test]
    fn json_events_are_tagged() {
        let event = ProgressEvent::Batch {
            codebase_id: "cb".into(),
            phase: SyncPhase::Embedding,
            progress: 42,
            done: 1,
            total: 3,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "batch");
        assert_eq!(v["phase"], "embedding");
        assert_eq!(v["progress"], 42);
    }
}
