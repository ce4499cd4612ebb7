//! Kill classification for one mutant/test encounter.
//!
//! Two oracle families exist and their taxonomies are kept apart:
//! [`DifferentialOracle`] compares a generated program's behaviour before and
//! after mutation, [`RegressionOracle`] looks for reliably-passing
//! conformance sub-tests that start failing. Both are pure.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::outputs::{ProgramOutput, parse_program_output};
use super::process::{ExecutionResult, RunOutcome};
use super::subtests::{SubtestOutcomes, SubtestStatus, with_status};

/// Common view over the two kill-status taxonomies.
pub trait KillStatus: Copy + fmt::Debug + Eq {
    /// True if the encounter proves the mutant observably changes behaviour.
    fn is_kill(&self) -> bool;
    /// Stable upper-snake name, as persisted in kill records.
    fn as_str(&self) -> &'static str;
}

/// Statuses of the differential-output oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramKillStatus {
    /// Behaviour identical to the baseline.
    SurvivedIdentical,
    /// Raw stdout differed but the structured outputs were equal.
    SurvivedBinaryDifference,
    /// The mutated compiler exited non-zero.
    KillCompilerCrash,
    /// The mutated compiler did not finish in time.
    KillCompilerTimeout,
    /// The compiled program did not finish in time.
    KillRuntimeTimeout,
    /// Exit codes differ.
    KillDifferentExitCodes,
    /// Structured outputs differ.
    KillDifferentStdout,
    /// Stderr differs byte-for-byte.
    KillDifferentStderr,
}

impl KillStatus for ProgramKillStatus {
    fn is_kill(&self) -> bool {
        !matches!(
            self,
            Self::SurvivedIdentical | Self::SurvivedBinaryDifference
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::SurvivedIdentical => "SURVIVED_IDENTICAL",
            Self::SurvivedBinaryDifference => "SURVIVED_BINARY_DIFFERENCE",
            Self::KillCompilerCrash => "KILL_COMPILER_CRASH",
            Self::KillCompilerTimeout => "KILL_COMPILER_TIMEOUT",
            Self::KillRuntimeTimeout => "KILL_RUNTIME_TIMEOUT",
            Self::KillDifferentExitCodes => "KILL_DIFFERENT_EXIT_CODES",
            Self::KillDifferentStdout => "KILL_DIFFERENT_STDOUT",
            Self::KillDifferentStderr => "KILL_DIFFERENT_STDERR",
        }
    }
}

/// Statuses of the pass/fail-regression oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteKillStatus {
    /// No reliable sub-test regressed.
    Survived,
    /// At least one reliable, baseline-passing sub-test failed.
    KillTestFail,
    /// The mutated suite run timed out. Not a kill.
    TestTimeout,
}

impl KillStatus for SuiteKillStatus {
    fn is_kill(&self) -> bool {
        matches!(self, Self::KillTestFail)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Survived => "SURVIVED",
            Self::KillTestFail => "KILL_TEST_FAIL",
            Self::TestTimeout => "TEST_TIMEOUT",
        }
    }
}

/// Oracle-specific evidence stored with a kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "oracle", rename_all = "snake_case")]
pub enum KillEvidence {
    /// Differential oracle: both stdout captures.
    Program {
        /// Baseline stdout.
        unmutated_stdout: String,
        /// Mutated stdout; empty when nothing was captured.
        mutated_stdout: String,
    },
    /// Regression oracle: the sub-tests that regressed.
    Suite {
        /// Reliable sub-tests that passed at baseline and failed mutated.
        killing_tests: Vec<String>,
    },
}

/// Classification of one encounter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict<S> {
    /// Status.
    pub status: S,
    /// Evidence; present for kills.
    pub evidence: Option<KillEvidence>,
}

impl<S: KillStatus> Verdict<S> {
    /// Shortcut for `status.is_kill()`.
    pub fn is_kill(&self) -> bool {
        self.status.is_kill()
    }

    /// Status and evidence of a kill; `None` for survivals.
    pub fn into_kill(self) -> Option<(S, KillEvidence)> {
        if !self.status.is_kill() {
            return None;
        }
        self.evidence.map(|evidence| (self.status, evidence))
    }
}

/// Decision function comparing baseline and mutated behaviour.
pub trait Oracle {
    /// Validated baseline for one test.
    type Baseline;
    /// What running the test against one mutant produced.
    type Trial;
    /// Status taxonomy.
    type Status: KillStatus;

    /// Classify one trial. Total: every input maps to exactly one status.
    fn classify(&self, baseline: &Self::Baseline, trial: &Self::Trial) -> Verdict<Self::Status>;
}

/// Mutated run of a generated program.
///
/// Where compiling and running happen in one subprocess the harness maps a
/// timeout to [`ProgramTrial::CompileTimedOut`] and a non-zero exit to
/// [`ProgramTrial::CompileFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramTrial {
    /// Compilation with the mutant did not finish in time.
    CompileTimedOut,
    /// Compilation with the mutant exited non-zero.
    CompileFailed(ExecutionResult),
    /// The program was executed.
    Executed(RunOutcome),
}

/// Differential-output oracle.
///
/// The baseline must be a completed run with exit code zero; the harness
/// checks that before a test is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct DifferentialOracle {
    /// Report raw-stdout-only differences as
    /// [`ProgramKillStatus::SurvivedBinaryDifference`] instead of
    /// [`ProgramKillStatus::SurvivedIdentical`].
    pub distinguish_binary_differences: bool,
}

impl DifferentialOracle {
    fn verdict(
        status: ProgramKillStatus,
        baseline: &ExecutionResult,
        mutated_stdout: &[u8],
    ) -> Verdict<ProgramKillStatus> {
        let evidence = status.is_kill().then(|| KillEvidence::Program {
            unmutated_stdout: baseline.stdout_text(),
            mutated_stdout: String::from_utf8_lossy(mutated_stdout).into_owned(),
        });
        Verdict { status, evidence }
    }

    fn compare(&self, baseline: &ExecutionResult, mutated: &ExecutionResult) -> ProgramKillStatus {
        if baseline.exit_code != mutated.exit_code {
            return ProgramKillStatus::KillDifferentExitCodes;
        }

        let raw_stdout_differs = baseline.stdout != mutated.stdout;
        if raw_stdout_differs {
            let mutated_output = parse_program_output(&mutated.stdout);
            if mutated_output == Ok(ProgramOutput::Timeout) {
                return ProgramKillStatus::KillRuntimeTimeout;
            }
            match (parse_program_output(&baseline.stdout), mutated_output) {
                (Ok(expected), Ok(actual)) if expected == actual => {}
                _ => return ProgramKillStatus::KillDifferentStdout,
            }
        }

        if baseline.stderr != mutated.stderr {
            return ProgramKillStatus::KillDifferentStderr;
        }
        if raw_stdout_differs && self.distinguish_binary_differences {
            ProgramKillStatus::SurvivedBinaryDifference
        } else {
            ProgramKillStatus::SurvivedIdentical
        }
    }
}

impl Oracle for DifferentialOracle {
    type Baseline = ExecutionResult;
    type Trial = ProgramTrial;
    type Status = ProgramKillStatus;

    fn classify(&self, baseline: &ExecutionResult, trial: &ProgramTrial) -> Verdict<ProgramKillStatus> {
        match trial {
            ProgramTrial::CompileTimedOut => {
                Self::verdict(ProgramKillStatus::KillCompilerTimeout, baseline, &[])
            }
            ProgramTrial::CompileFailed(result) => {
                Self::verdict(ProgramKillStatus::KillCompilerCrash, baseline, &result.stdout)
            }
            ProgramTrial::Executed(RunOutcome::TimedOut) => {
                Self::verdict(ProgramKillStatus::KillRuntimeTimeout, baseline, &[])
            }
            ProgramTrial::Executed(RunOutcome::Completed(mutated)) => {
                Self::verdict(self.compare(baseline, mutated), baseline, &mutated.stdout)
            }
        }
    }
}

/// Mutated run of a conformance query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteTrial {
    /// The run did not finish in time.
    TimedOut,
    /// Parsed sub-test outcomes of a finished run.
    Completed(SubtestOutcomes),
}

/// Pass/fail-regression oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegressionOracle {
    reliable: BTreeSet<String>,
}

impl RegressionOracle {
    /// Oracle that only lets `reliable` sub-tests cause a kill.
    pub fn new(reliable: BTreeSet<String>) -> Self {
        Self { reliable }
    }

    /// Sub-tests known to pass deterministically on unmutated code.
    pub fn reliable(&self) -> &BTreeSet<String> {
        &self.reliable
    }

    /// Reliable sub-tests that pass in `baseline`; only these can kill.
    pub fn eligible(&self, baseline: &SubtestOutcomes) -> BTreeSet<String> {
        with_status(baseline, SubtestStatus::Pass)
            .intersection(&self.reliable)
            .cloned()
            .collect()
    }
}

impl Oracle for RegressionOracle {
    type Baseline = SubtestOutcomes;
    type Trial = SuiteTrial;
    type Status = SuiteKillStatus;

    fn classify(&self, baseline: &SubtestOutcomes, trial: &SuiteTrial) -> Verdict<SuiteKillStatus> {
        let mutated = match trial {
            SuiteTrial::TimedOut => {
                return Verdict {
                    status: SuiteKillStatus::TestTimeout,
                    evidence: None,
                };
            }
            SuiteTrial::Completed(mutated) => mutated,
        };

        let failing = with_status(mutated, SubtestStatus::Fail);
        let killing: Vec<String> = self
            .eligible(baseline)
            .intersection(&failing)
            .cloned()
            .collect();
        if killing.is_empty() {
            Verdict {
                status: SuiteKillStatus::Survived,
                evidence: None,
            }
        } else {
            Verdict {
                status: SuiteKillStatus::KillTestFail,
                evidence: Some(KillEvidence::Suite {
                    killing_tests: killing,
                }),
            }
        }
    }
}
