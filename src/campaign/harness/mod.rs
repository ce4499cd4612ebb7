//! Test collaborators: where tests come from and how they are run against
//! the unmutated, coverage-tracking and mutated builds.

mod fuzz;
mod suite;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::config::CampaignConfig;
use super::oracle::Oracle;
use super::process::{CommandSpec, ProcessError, RunOutcome};
use super::subtests::SubtestParseError;
use super::tree::MutationId;

pub use fuzz::{FuzzHarness, FuzzSettings};
pub use suite::{SuiteCommand, SuiteHarness, find_reliable_subtests, load_queries, query_test_name};

/// Collaborator failures that abort the campaign.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Subprocess could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Conformance runner output was inconsistent.
    #[error("conformance output: {0}")]
    Subtests(#[from] SubtestParseError),
    /// Work-area or artifact I/O.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Tracking output contained something other than ids.
    #[error("tracking output line {line}: {text:?} is not a mutation id")]
    Tracking {
        /// 1-based line.
        line: usize,
        /// Offending text.
        text: String,
    },
    /// Query list is not a JSON array of strings.
    #[error("invalid query list {path}: {source}")]
    Queries {
        /// Query file.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

impl HarnessError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One test handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Store key; a single path component.
    pub name: String,
    /// Human-readable description (seed or query).
    pub label: String,
}

/// What the test source produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTest {
    /// A test is prepared in the work area.
    Ready(TestCase),
    /// Preparing a test failed; try again.
    Retry(String),
    /// No more tests.
    Exhausted,
}

/// Result of the unmutated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineOutcome<B> {
    /// Baseline the oracle can compare against.
    Usable(B),
    /// The test is unusable; the reason is logged.
    Abandon(String),
}

/// Result of the coverage-tracking run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageOutcome {
    /// Raw tracking output, one id per line.
    Tracked(Vec<u8>),
    /// The run finished without writing tracking output.
    Missing,
    /// The run did not finish in time.
    TimedOut,
}

/// Baseline type of a harness's oracle.
pub type HarnessBaseline<H> = <<H as TestHarness>::Oracle as Oracle>::Baseline;
/// Trial type of a harness's oracle.
pub type HarnessTrial<H> = <<H as TestHarness>::Oracle as Oracle>::Trial;

/// Test source plus the three ways of running a test.
pub trait TestHarness {
    /// Oracle that classifies this harness's trials.
    type Oracle: Oracle;

    /// Oracle instance.
    fn oracle(&self) -> &Self::Oracle;

    /// Short oracle family name for journals.
    fn oracle_name(&self) -> &'static str;

    /// Prepare the next test inside `work`.
    fn next_test(&mut self, work: &Path) -> Result<NextTest, HarnessError>;

    /// Run the test against the unmutated build.
    fn baseline(
        &mut self,
        test: &TestCase,
        work: &Path,
    ) -> Result<BaselineOutcome<HarnessBaseline<Self>>, HarnessError>;

    /// Run the test against the coverage-tracking build.
    fn coverage(&mut self, test: &TestCase, work: &Path) -> Result<CoverageOutcome, HarnessError>;

    /// Run the test with exactly `mutation` enabled.
    fn trial(
        &mut self,
        test: &TestCase,
        work: &Path,
        mutation: MutationId,
    ) -> Result<HarnessTrial<Self>, HarnessError>;

    /// Files kept next to the test's summary.
    fn artifacts(&self, _test: &TestCase, _work: &Path) -> Result<Vec<(String, Vec<u8>)>, HarnessError> {
        Ok(Vec::new())
    }
}

/// Environment wiring for the mutation engine's builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutantEnv {
    enabled_mutation_env: String,
    tracking_file_env: String,
    extra_env: std::collections::BTreeMap<String, String>,
}

impl MutantEnv {
    /// Variable names and extras from the campaign configuration.
    pub fn from_config(config: &CampaignConfig) -> Self {
        Self {
            enabled_mutation_env: config.enabled_mutation_env.clone(),
            tracking_file_env: config.tracking_file_env.clone(),
            extra_env: config.extra_env.clone(),
        }
    }

    /// Command with the extra variables and neither mutation variable.
    pub fn unmutated(&self, spec: CommandSpec) -> CommandSpec {
        spec.env_remove(self.enabled_mutation_env.clone())
            .env_remove(self.tracking_file_env.clone())
            .envs(&self.extra_env)
    }

    /// Command with exactly `mutation` selected.
    pub fn mutated(&self, spec: CommandSpec, mutation: MutationId) -> CommandSpec {
        self.unmutated(spec)
            .env(self.enabled_mutation_env.clone(), mutation.to_string())
    }

    /// Command that writes covered ids to `tracking_file`.
    pub fn tracking(&self, spec: CommandSpec, tracking_file: &Path) -> CommandSpec {
        self.unmutated(spec)
            .env(self.tracking_file_env.clone(), tracking_file.as_os_str())
    }
}

/// Tracking file name inside the work area.
pub const TRACKING_FILE: &str = "covered_mutants";

/// Interpret the tracking run: read the tracking file if it was written.
pub fn collect_tracking(outcome: RunOutcome, tracking_file: &Path) -> Result<CoverageOutcome, HarnessError> {
    if outcome == RunOutcome::TimedOut {
        return Ok(CoverageOutcome::TimedOut);
    }
    match std::fs::read(tracking_file) {
        Ok(raw) => Ok(CoverageOutcome::Tracked(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CoverageOutcome::Missing),
        Err(source) => Err(HarnessError::Io {
            path: tracking_file.to_path_buf(),
            source,
        }),
    }
}

/// Distinct covered ids from tracking output; blank lines are ignored.
pub fn parse_covered_mutants(raw: &[u8]) -> Result<BTreeSet<MutationId>, HarnessError> {
    let text = String::from_utf8_lossy(raw);
    let mut covered = BTreeSet::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = line.parse::<MutationId>().map_err(|_| HarnessError::Tracking {
            line: index + 1,
            text: line.to_string(),
        })?;
        covered.insert(id);
    }
    Ok(covered)
}

/// Map any text to a single path component of `[A-Za-z0-9_.,=-]`.
pub fn sanitize_test_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ',' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("test_{}", name.replace('.', "_")),
        _ => name,
    }
}
