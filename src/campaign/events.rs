//! Event model for the append-only per-worker journal.

use serde::{Deserialize, Serialize};

use super::policy::StopReason;
use super::tree::MutationId;

/// Journal event emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    /// Worker began taking tests.
    WorkerStarted {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Worker process id.
        pid: u32,
        /// `program` or `suite`.
        oracle: String,
        /// Number of mutations in the loaded description.
        num_mutations: usize,
    },
    /// Worker claimed a test and started its baseline.
    TestStarted {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
    },
    /// Test was already claimed by some worker.
    TestSkipped {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
    },
    /// Test could not produce a usable baseline or coverage.
    TestAbandoned {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
        /// Human-readable reason.
        reason: String,
    },
    /// One mutant was run against the test and classified.
    MutantTried {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
        /// Mutation id.
        mutant: MutationId,
        /// Kill status name.
        status: String,
        /// Trial wall time.
        duration_ms: u64,
    },
    /// A kill verdict was offered to the ledger.
    MutantKilled {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
        /// Mutation id.
        mutant: MutationId,
        /// Kill status name.
        kill_type: String,
        /// False if another worker claimed it first.
        claimed: bool,
    },
    /// Test summary was written.
    TestSummarized {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Test name.
        test: String,
        /// Covered candidates.
        covered: usize,
        /// Killed by this test.
        killed: usize,
        /// Already killed elsewhere.
        skipped: usize,
        /// Survived under this test.
        survived: usize,
        /// Loop cut short by a stop condition.
        terminated_early: bool,
    },
    /// Worker stopped.
    WorkerStopped {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Why it stopped.
        reason: StopReason,
        /// Tests summarized by this worker.
        tests_summarized: usize,
        /// Kills claimed by this worker.
        kills: usize,
    },
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
