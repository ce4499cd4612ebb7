//! Mutant-kill campaigns for compiler mutation testing.

pub mod config;
pub mod events;
pub mod harness;
pub mod journal;
pub mod ledger;
pub mod oracle;
pub mod outputs;
pub mod policy;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod subtests;
pub mod tree;

pub use config::CampaignConfig;
pub use events::CampaignEvent;
pub use harness::{
    BaselineOutcome, CoverageOutcome, FuzzHarness, FuzzSettings, HarnessError, MutantEnv,
    NextTest, SuiteCommand, SuiteHarness, TestCase, TestHarness, find_reliable_subtests,
    load_queries,
};
pub use journal::{Journal, JournalError, WorkerSnapshot, replay_all, replay_journal};
pub use ledger::{
    ClaimOutcome, ClaimStore, DirStore, KillRecord, Ledger, LedgerError, MemoryStore,
    TestSummary, TrackingRecord,
};
pub use oracle::{
    DifferentialOracle, KillEvidence, KillStatus, Oracle, ProgramKillStatus, ProgramTrial,
    RegressionOracle, SuiteKillStatus, SuiteTrial, Verdict,
};
pub use policy::{CampaignClock, StopPolicy, StopReason};
pub use process::{CommandSpec, ExecutionResult, ProcessError, RunOutcome, run_with_timeout};
pub use report::{CampaignReport, ReportFormat};
pub use scheduler::{CampaignError, CampaignOutcome, Scheduler};
pub use subtests::{
    SubtestOutcomes, SubtestStatus, load_reliable_subtests, reliable_subtests,
    save_reliable_subtests,
};
pub use tree::{MutationId, MutationTree, TreeError, load_matching_trees};
