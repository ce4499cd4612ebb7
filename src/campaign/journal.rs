//! Per-worker JSONL journal and its replay into a status snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::events::CampaignEvent;
use super::policy::StopReason;
use super::tree::MutationId;

/// Journal directory under the kill-tracking root.
pub const JOURNAL_DIR: &str = "journal";

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// IO failure.
    #[error("journal io error at {path}: {source}")]
    Io {
        /// Journal file or directory.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Event could not be serialized.
    #[error("journal event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only event sink for one worker.
#[derive(Debug, Clone)]
pub struct Journal {
    path: Option<PathBuf>,
}

impl Journal {
    /// Journal at `<kill_root>/journal/worker-<pid>.jsonl`.
    pub fn for_worker(kill_root: &Path, pid: u32) -> Result<Self, JournalError> {
        let dir = kill_root.join(JOURNAL_DIR);
        std::fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            path: Some(dir.join(format!("worker-{pid}.jsonl"))),
        })
    }

    /// Journal that drops every event.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Journal file, if enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event as a JSON line.
    pub fn append(&self, event: &CampaignEvent) -> Result<(), JournalError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let io = |source| JournalError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io)?;
        file.write_all(&line).map_err(io)?;
        file.flush().map_err(io)?;
        Ok(())
    }
}

/// Materialized view of one worker's journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker process id, from the start event.
    pub pid: Option<u32>,
    /// Oracle family the worker ran.
    pub oracle: Option<String>,
    /// Tests started.
    pub tests_started: BTreeSet<String>,
    /// Tests found already claimed.
    pub tests_skipped: usize,
    /// Abandoned tests and why.
    pub tests_abandoned: BTreeMap<String, String>,
    /// Tests summarized.
    pub tests_summarized: BTreeSet<String>,
    /// Tests summarized with the loop cut short.
    pub tests_terminated_early: BTreeSet<String>,
    /// Trials run.
    pub mutants_tried: usize,
    /// Kills this worker claimed: id to (test, kill type).
    pub kills: BTreeMap<MutationId, (String, String)>,
    /// Kill verdicts that lost the claim race.
    pub lost_races: usize,
    /// Set once the worker stopped cleanly.
    pub stop_reason: Option<StopReason>,
    /// Number of malformed lines ignored.
    pub malformed_lines: usize,
}

impl WorkerSnapshot {
    /// Tests started but neither summarized nor abandoned.
    pub fn in_flight_tests(&self) -> Vec<String> {
        self.tests_started
            .iter()
            .filter(|t| !self.tests_summarized.contains(*t) && !self.tests_abandoned.contains_key(*t))
            .cloned()
            .collect()
    }

    fn apply(&mut self, event: CampaignEvent) {
        match event {
            CampaignEvent::WorkerStarted { pid, oracle, .. } => {
                self.pid = Some(pid);
                self.oracle = Some(oracle);
            }
            CampaignEvent::TestStarted { test, .. } => {
                self.tests_started.insert(test);
            }
            CampaignEvent::TestSkipped { .. } => self.tests_skipped += 1,
            CampaignEvent::TestAbandoned { test, reason, .. } => {
                self.tests_abandoned.insert(test, reason);
            }
            CampaignEvent::MutantTried { .. } => self.mutants_tried += 1,
            CampaignEvent::MutantKilled {
                test,
                mutant,
                kill_type,
                claimed,
                ..
            } => {
                if claimed {
                    self.kills.insert(mutant, (test, kill_type));
                } else {
                    self.lost_races += 1;
                }
            }
            CampaignEvent::TestSummarized {
                test,
                terminated_early,
                ..
            } => {
                if terminated_early {
                    self.tests_terminated_early.insert(test.clone());
                }
                self.tests_summarized.insert(test);
            }
            CampaignEvent::WorkerStopped { reason, .. } => self.stop_reason = Some(reason),
        }
    }
}

/// Replay one journal file.
pub fn replay_journal(path: &Path) -> Result<WorkerSnapshot, JournalError> {
    let io = |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(std::fs::File::open(path).map_err(io)?);
    let mut snapshot = WorkerSnapshot::default();
    for line in reader.lines() {
        let line = line.map_err(io)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CampaignEvent>(&line) {
            Ok(event) => snapshot.apply(event),
            Err(_) => snapshot.malformed_lines += 1,
        }
    }
    Ok(snapshot)
}

/// Replay every worker journal under `kill_root`, ordered by file name.
pub fn replay_all(kill_root: &Path) -> Result<Vec<(PathBuf, WorkerSnapshot)>, JournalError> {
    let dir = kill_root.join(JOURNAL_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(JournalError::Io { path: dir, source }),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| JournalError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            paths.push(path);
        }
    }
    paths.sort();
    paths
        .into_iter()
        .map(|path| replay_journal(&path).map(|snapshot| (path, snapshot)))
        .collect()
}
