//! Persistence seam
//!
//! The coordinator records what happened through [`Persister`]; durable
//! storage formats live behind it. [`EventLog`] keeps records in memory and,
//! when given a path, appends each one as a JSON line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decisions::Rule;
use crate::error::CoordinatorResult;
use crate::events::ParticipantSummary;
use crate::registry::{ParticipantId, TrustGameDecision};
use crate::sanction::{PostRoundSanctions, SanctionRequest};

/// Aggregate written once per round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_number: usize,
    pub groups: usize,
    pub participants: Vec<ParticipantSummary>,
}

/// Everything the coordinator records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum PersistedRecord {
    RoundStarted {
        participants: usize,
        groups: usize,
    },
    SanctionApplied {
        request: SanctionRequest,
        cost: u32,
        penalty: u32,
    },
    PostRoundSanction {
        source: ParticipantId,
        sanctions: PostRoundSanctions,
    },
    Chat {
        from: ParticipantId,
        target: Option<ParticipantId>,
        message: String,
    },
    QuizResponse {
        participant: ParticipantId,
        correct_answers: u32,
        incorrect_questions: Vec<String>,
    },
    RuleVote {
        participant: ParticipantId,
        rule: Rule,
    },
    TrustGameSubmission {
        participant: ParticipantId,
        decision: TrustGameDecision,
    },
    RoundSummary(RoundSummary),
}

impl PersistedRecord {
    pub fn record_type(&self) -> &'static str {
        match self {
            PersistedRecord::RoundStarted { .. } => "round_started",
            PersistedRecord::SanctionApplied { .. } => "sanction_applied",
            PersistedRecord::PostRoundSanction { .. } => "post_round_sanction",
            PersistedRecord::Chat { .. } => "chat",
            PersistedRecord::QuizResponse { .. } => "quiz_response",
            PersistedRecord::RuleVote { .. } => "rule_vote",
            PersistedRecord::TrustGameSubmission { .. } => "trust_game_submission",
            PersistedRecord::RoundSummary(_) => "round_summary",
        }
    }
}

/// A stored record with its round and wall-clock time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub round_number: usize,
    pub timestamp: DateTime<Utc>,
    pub record: PersistedRecord,
}

/// Storage for round records
pub trait Persister: Send {
    /// Prepare for a new round.
    fn initialize(&mut self, round_number: usize) -> CoordinatorResult<()>;

    fn store(&mut self, record: PersistedRecord) -> CoordinatorResult<()>;

    /// Write the round aggregate. Called once per round after sanctioning.
    fn persist_round(&mut self, summary: RoundSummary) -> CoordinatorResult<()> {
        self.store(PersistedRecord::RoundSummary(summary))
    }
}

#[derive(Debug, Default)]
struct LogInner {
    path: Option<PathBuf>,
    round_number: usize,
    entries: Vec<LogEntry>,
}

/// In-memory record log with optional JSON-lines file. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Log that also appends every entry to `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let log = Self::default();
        log.lock().path = Some(path.into());
        log
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }

    /// Records of one type, in order.
    pub fn records_of(&self, record_type: &str) -> Vec<PersistedRecord> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.record.record_type() == record_type)
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    /// Read back a JSON-lines log written by [`EventLog::with_file`].
    pub fn read_file(path: &Path) -> CoordinatorResult<Vec<LogEntry>> {
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

fn append_line(path: &Path, entry: &LogEntry) -> CoordinatorResult<()> {
    let json = serde_json::to_string(entry)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

impl Persister for EventLog {
    fn initialize(&mut self, round_number: usize) -> CoordinatorResult<()> {
        let mut inner = self.lock();
        inner.round_number = round_number;
        if let Some(path) = &inner.path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            info!(path = %path.display(), round_number, "Event log ready");
        }
        Ok(())
    }

    fn store(&mut self, record: PersistedRecord) -> CoordinatorResult<()> {
        let mut inner = self.lock();
        let entry = LogEntry {
            round_number: inner.round_number,
            timestamp: Utc::now(),
            record,
        };
        if let Some(path) = &inner.path {
            append_line(path, &entry)?;
        }
        debug!(
            record_type = entry.record.record_type(),
            round_number = entry.round_number,
            "Record stored"
        );
        inner.entries.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_entries() {
        let log = EventLog::in_memory();
        let mut writer: Box<dyn Persister> = Box::new(log.clone());
        writer.initialize(2).unwrap();
        writer
            .store(PersistedRecord::RoundStarted {
                participants: 3,
                groups: 1,
            })
            .unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].round_number, 2);
        assert_eq!(log.records_of("round_started").len(), 1);
    }

    #[test]
    fn test_jsonl_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let mut log = EventLog::with_file(&path);
        log.initialize(0).unwrap();
        log.store(PersistedRecord::RuleVote {
            participant: ParticipantId(1),
            rule: Rule::new("A"),
        })
        .unwrap();
        log.persist_round(RoundSummary {
            round_number: 0,
            groups: 1,
            participants: vec![],
        })
        .unwrap();

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 2);
        let entries = EventLog::read_file(&path).unwrap();
        assert_eq!(entries[1].record.record_type(), "round_summary");
        assert_eq!(entries, log.entries());
    }
}
