//! Campaign loop for one worker process.
//!
//! Workers share nothing but the [`Ledger`]. Tests are claimed before they
//! run and mutants are claimed when killed, so any number of workers can run
//! against the same kill root, and a restarted worker resumes where the
//! previous one stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use super::config::CampaignConfig;
use super::events::{CampaignEvent, now_timestamp_ms};
use super::harness::{
    BaselineOutcome, CoverageOutcome, HarnessError, NextTest, TestCase, TestHarness,
    parse_covered_mutants,
};
use super::journal::{Journal, JournalError};
use super::ledger::{ClaimOutcome, ClaimStore, DirStore, KillRecord, Ledger, LedgerError, TestSummary};
use super::oracle::{KillStatus, Oracle};
use super::policy::{CampaignClock, StopPolicy, StopReason};
use super::tree::{MutationId, MutationTree, TreeError};

/// Errors that abort a campaign.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// Mutation descriptions are malformed or disagree.
    #[error("mutation tree error: {0}")]
    Tree(#[from] TreeError),
    /// Shared store failure.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// Journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    /// Collaborator failure.
    #[error("harness error: {0}")]
    Harness(#[from] HarnessError),
    /// Work-area I/O.
    #[error("work area io error at {path}: {source}")]
    WorkArea {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// What one worker achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignOutcome {
    /// Why the worker stopped.
    pub stop_reason: StopReason,
    /// Tests summarized.
    pub tests_summarized: usize,
    /// Tests abandoned before summarizing.
    pub tests_abandoned: usize,
    /// Tests another worker had already claimed.
    pub tests_skipped: usize,
    /// Mutants this worker claimed.
    pub kills: BTreeSet<MutationId>,
    /// Kills another worker claimed first.
    pub lost_races: usize,
}

impl CampaignOutcome {
    fn new() -> Self {
        Self {
            stop_reason: StopReason::Exhausted,
            tests_summarized: 0,
            tests_abandoned: 0,
            tests_skipped: 0,
            kills: BTreeSet::new(),
            lost_races: 0,
        }
    }
}

/// Drives one harness through the campaign state machine.
pub struct Scheduler<'a, H, S = DirStore> {
    harness: H,
    ledger: &'a Ledger<S>,
    config: CampaignConfig,
    journal: Journal,
    stop: Arc<AtomicBool>,
    work: tempfile::TempDir,
}

impl<'a, H, S> Scheduler<'a, H, S>
where
    H: TestHarness,
    S: ClaimStore,
{
    /// Scheduler with a fresh work area and no journal.
    pub fn new(harness: H, ledger: &'a Ledger<S>, config: CampaignConfig) -> Result<Self, CampaignError> {
        let work = tempfile::Builder::new()
            .prefix("mutant-campaign-")
            .tempdir()
            .map_err(|source| CampaignError::WorkArea {
                path: std::env::temp_dir(),
                source,
            })?;
        Ok(Self {
            harness,
            ledger,
            config,
            journal: Journal::disabled(),
            stop: Arc::new(AtomicBool::new(false)),
            work,
        })
    }

    /// Append events to `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Stop cooperatively once `flag` is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = flag;
        self
    }

    /// Harness, for inspection after a run.
    pub fn harness(&self) -> &H {
        &self.harness
    }

    /// Working directory cleared before every test.
    pub fn work_dir(&self) -> &Path {
        self.work.path()
    }

    fn emit(&self, event: CampaignEvent) -> Result<(), CampaignError> {
        self.journal.append(&event)?;
        Ok(())
    }

    fn stop_reason(&self, clock: &CampaignClock) -> Option<StopReason> {
        if self.stop.load(Ordering::SeqCst) {
            return Some(StopReason::Interrupted);
        }
        clock.stop_reason()
    }

    fn reset_work_area(&self) -> Result<(), CampaignError> {
        let dir = self.work.path();
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CampaignError::WorkArea { path, source }
        };
        for entry in std::fs::read_dir(dir).map_err(io(dir))? {
            let path = entry.map_err(io(dir))?.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(io(&path))?;
        }
        Ok(())
    }

    /// Candidates for `test`, in ascending order: covered target ids.
    fn covered_targets(&self, raw: &[u8]) -> Result<Vec<MutationId>, CampaignError> {
        Ok(parse_covered_mutants(raw)?
            .into_iter()
            .filter(|id| self.config.is_target(*id))
            .collect())
    }

    /// Run the campaign until the test source is exhausted or a stop
    /// condition fires.
    pub fn run(&mut self, tree: &MutationTree) -> Result<CampaignOutcome, CampaignError> {
        let mut clock = CampaignClock::start(StopPolicy::from_config(&self.config));
        let mut outcome = CampaignOutcome::new();
        self.emit(CampaignEvent::WorkerStarted {
            timestamp_ms: now_timestamp_ms(),
            pid: std::process::id(),
            oracle: self.harness.oracle_name().to_string(),
            num_mutations: tree.num_mutations(),
        })?;
        tracing::info!(
            oracle = self.harness.oracle_name(),
            num_mutations = tree.num_mutations(),
            work = %self.work_dir().display(),
            "worker started"
        );

        let stop_reason = loop {
            if let Some(reason) = self.stop_reason(&clock) {
                break reason;
            }
            self.reset_work_area()?;
            let test = match self.harness.next_test(self.work.path())? {
                NextTest::Ready(test) => test,
                NextTest::Retry(reason) => {
                    tracing::warn!(%reason, "could not prepare a test");
                    continue;
                }
                NextTest::Exhausted => break StopReason::Exhausted,
            };

            if self.ledger.claim_test(&test.name)? == ClaimOutcome::AlreadyClaimed {
                tracing::info!(test = %test.name, "skipping test claimed by another worker");
                outcome.tests_skipped += 1;
                self.emit(CampaignEvent::TestSkipped {
                    timestamp_ms: now_timestamp_ms(),
                    test: test.name.clone(),
                })?;
                continue;
            }
            self.emit(CampaignEvent::TestStarted {
                timestamp_ms: now_timestamp_ms(),
                test: test.name.clone(),
            })?;
            tracing::info!(test = %test.name, label = %test.label, "test started");
            self.run_test(&test, &mut clock, &mut outcome)?;
        };
        outcome.stop_reason = stop_reason;

        tracing::info!(
            reason = ?outcome.stop_reason,
            tests = outcome.tests_summarized,
            kills = outcome.kills.len(),
            elapsed_secs = clock.elapsed_at(Instant::now()).as_secs(),
            "worker stopped"
        );
        self.emit(CampaignEvent::WorkerStopped {
            timestamp_ms: now_timestamp_ms(),
            reason: outcome.stop_reason,
            tests_summarized: outcome.tests_summarized,
            kills: outcome.kills.len(),
        })?;
        Ok(outcome)
    }

    fn abandon(&self, test: &TestCase, reason: &str, outcome: &mut CampaignOutcome) -> Result<(), CampaignError> {
        tracing::info!(test = %test.name, %reason, "abandoning test");
        outcome.tests_abandoned += 1;
        self.ledger.record_abandoned(&test.name, reason)?;
        self.emit(CampaignEvent::TestAbandoned {
            timestamp_ms: now_timestamp_ms(),
            test: test.name.clone(),
            reason: reason.to_string(),
        })
    }

    fn run_test(
        &mut self,
        test: &TestCase,
        clock: &mut CampaignClock,
        outcome: &mut CampaignOutcome,
    ) -> Result<(), CampaignError> {
        let baseline = match self.harness.baseline(test, self.work.path())? {
            BaselineOutcome::Usable(baseline) => baseline,
            BaselineOutcome::Abandon(reason) => return self.abandon(test, &reason, outcome),
        };

        let raw = match self.harness.coverage(test, self.work.path())? {
            CoverageOutcome::Tracked(raw) => {
                self.ledger.record_tracking(&test.name, &raw)?;
                raw
            }
            CoverageOutcome::Missing => {
                self.ledger.record_no_tracking(&test.name)?;
                return self.abandon(test, "no mutant tracking file created", outcome);
            }
            CoverageOutcome::TimedOut => {
                return self.abandon(test, "mutant tracking run timed out", outcome);
            }
        };

        let covered = self.covered_targets(&raw)?;
        let mut summary = TestSummary {
            test: test.name.clone(),
            covered_mutants: covered.clone(),
            ..TestSummary::default()
        };
        let mut candidates = Vec::with_capacity(covered.len());
        for id in covered {
            if self.ledger.is_killed(id)? {
                summary.skipped_mutants.push(id);
            } else {
                candidates.push(id);
            }
        }
        tracing::info!(
            test = %test.name,
            covered = summary.covered_mutants.len(),
            candidates = candidates.len(),
            "selected candidate mutants"
        );

        for id in candidates {
            if self.stop_reason(clock).is_some() {
                break;
            }
            if self.ledger.is_killed(id)? {
                tracing::debug!(test = %test.name, mutant = id, "mutant killed elsewhere meanwhile");
                summary.skipped_mutants.push(id);
                continue;
            }

            let started = Instant::now();
            let trial = self.harness.trial(test, self.work.path(), id)?;
            let verdict = self.harness.oracle().classify(&baseline, &trial);
            let status = verdict.status.as_str();
            self.emit(CampaignEvent::MutantTried {
                timestamp_ms: now_timestamp_ms(),
                test: test.name.clone(),
                mutant: id,
                status: status.to_string(),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })?;

            let Some((kill_status, evidence)) = verdict.into_kill() else {
                tracing::debug!(test = %test.name, mutant = id, verdict = status, "mutant survived");
                summary.survived_mutants.push(id);
                continue;
            };

            let claimed = self.ledger.claim_mutant(id)? == ClaimOutcome::Claimed;
            if claimed {
                self.ledger.record_kill(
                    id,
                    &KillRecord {
                        killing_test: test.name.clone(),
                        kill_type: kill_status.as_str().to_string(),
                        evidence,
                    },
                )?;
                summary.killed_mutants.push(id);
                outcome.kills.insert(id);
                clock.record_kill();
                tracing::info!(
                    test = %test.name,
                    mutant = id,
                    verdict = status,
                    kills = outcome.kills.len(),
                    "kill"
                );
            } else {
                tracing::info!(test = %test.name, mutant = id, "mutant was independently killed");
                summary.skipped_mutants.push(id);
                outcome.lost_races += 1;
            }
            self.emit(CampaignEvent::MutantKilled {
                timestamp_ms: now_timestamp_ms(),
                test: test.name.clone(),
                mutant: id,
                kill_type: kill_status.as_str().to_string(),
                claimed,
            })?;
        }

        summary.killed_mutants.sort_unstable();
        summary.skipped_mutants.sort_unstable();
        summary.survived_mutants.sort_unstable();
        summary.terminated_early = !summary.is_complete_partition();

        for (file, bytes) in self.harness.artifacts(test, self.work.path())? {
            self.ledger.put_test_artifact(&test.name, &file, &bytes)?;
        }
        self.ledger.write_summary(&summary)?;
        outcome.tests_summarized += 1;
        tracing::info!(
            test = %test.name,
            killed = summary.killed_mutants.len(),
            skipped = summary.skipped_mutants.len(),
            survived = summary.survived_mutants.len(),
            terminated_early = summary.terminated_early,
            "test summarized"
        );
        self.emit(CampaignEvent::TestSummarized {
            timestamp_ms: now_timestamp_ms(),
            test: test.name.clone(),
            covered: summary.covered_mutants.len(),
            killed: summary.killed_mutants.len(),
            skipped: summary.skipped_mutants.len(),
            survived: summary.survived_mutants.len(),
            terminated_early: summary.terminated_early,
        })
    }

    /// Run up to `limit` tests through baseline and coverage only and report
    /// each test's candidate mutants. Nothing is claimed or killed.
    pub fn survey_coverage(&mut self, limit: usize) -> Result<BTreeMap<String, Vec<MutationId>>, CampaignError> {
        let clock = CampaignClock::start(StopPolicy::from_config(&self.config));
        let mut surveyed = BTreeMap::new();
        while surveyed.len() < limit && self.stop_reason(&clock).is_none() {
            self.reset_work_area()?;
            let test = match self.harness.next_test(self.work.path())? {
                NextTest::Ready(test) => test,
                NextTest::Retry(reason) => {
                    tracing::warn!(%reason, "could not prepare a test");
                    continue;
                }
                NextTest::Exhausted => break,
            };
            if let BaselineOutcome::Abandon(reason) = self.harness.baseline(&test, self.work.path())? {
                tracing::info!(test = %test.name, %reason, "survey skipping test");
                continue;
            }
            let CoverageOutcome::Tracked(raw) = self.harness.coverage(&test, self.work.path())? else {
                tracing::info!(test = %test.name, "survey skipping test without tracking output");
                continue;
            };
            let mut candidates = Vec::new();
            for id in self.covered_targets(&raw)? {
                if !self.ledger.is_killed(id)? {
                    candidates.push(id);
                }
            }
            tracing::info!(test = %test.name, candidates = candidates.len(), "surveyed");
            surveyed.insert(test.name, candidates);
        }
        Ok(surveyed)
    }
}
