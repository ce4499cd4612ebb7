//! Conformance-suite harness: queries under the regression oracle.

use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    BaselineOutcome, CoverageOutcome, HarnessError, MutantEnv, NextTest, TRACKING_FILE,
    TestCase, TestHarness, collect_tracking, sanitize_test_name,
};
use crate::campaign::config::CampaignConfig;
use crate::campaign::oracle::{RegressionOracle, SuiteTrial};
use crate::campaign::process::{CommandSpec, RunOutcome, run_with_timeout};
use crate::campaign::subtests::{SubtestOutcomes, parse_subtest_outcomes, reliable_subtests};
use crate::campaign::tree::MutationId;

/// Runner executable plus the arguments that precede the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteCommand {
    /// Runner executable.
    pub program: PathBuf,
    /// Leading arguments.
    pub args: Vec<OsString>,
}

impl SuiteCommand {
    /// Runner with no leading arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append leading arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn for_query(&self, query: &str) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .arg(query)
    }
}

/// Store key for a query: wildcards dropped, `:` turned into `-`.
pub fn query_test_name(query: &str) -> String {
    sanitize_test_name(&query.replace('*', "").replace(':', "-"))
}

/// Read a JSON array of query strings.
pub fn load_queries(path: &Path) -> Result<Vec<String>, HarnessError> {
    let raw = std::fs::read_to_string(path).map_err(HarnessError::io(path))?;
    serde_json::from_str(&raw).map_err(|source| HarnessError::Queries {
        path: path.to_path_buf(),
        source,
    })
}

/// Run every query `runs` times on the unmutated build and keep the
/// sub-tests that passed every time. A run that times out contributes no
/// passes for its query.
pub fn find_reliable_subtests(
    runner: &SuiteCommand,
    queries: &[String],
    runs: usize,
    timeout: Duration,
    env: &MutantEnv,
) -> Result<BTreeSet<String>, HarnessError> {
    let mut per_run = vec![SubtestOutcomes::new(); runs];
    for (round, outcomes) in per_run.iter_mut().enumerate() {
        for query in queries {
            tracing::info!(round, query = %query, "running query on unmutated build");
            match run_with_timeout(&env.unmutated(runner.for_query(query)), timeout)? {
                RunOutcome::TimedOut => {
                    tracing::warn!(round, query = %query, "query timed out; none of its sub-tests count as reliable");
                }
                RunOutcome::Completed(result) => {
                    outcomes.extend(parse_subtest_outcomes(&result.stdout_text())?);
                }
            }
        }
    }
    Ok(reliable_subtests(&per_run))
}

/// Conformance-suite harness.
#[derive(Debug)]
pub struct SuiteHarness {
    queries: VecDeque<String>,
    mutated: SuiteCommand,
    tracking: SuiteCommand,
    env: MutantEnv,
    run_timeout: Duration,
    compile_timeout: Duration,
    oracle: RegressionOracle,
}

impl SuiteHarness {
    /// Harness over `queries`, judging kills against `reliable` sub-tests.
    pub fn new(
        queries: impl IntoIterator<Item = String>,
        mutated: SuiteCommand,
        tracking: SuiteCommand,
        reliable: BTreeSet<String>,
        config: &CampaignConfig,
    ) -> Self {
        Self {
            queries: queries.into_iter().collect(),
            mutated,
            tracking,
            env: MutantEnv::from_config(config),
            run_timeout: config.run_timeout,
            compile_timeout: config.compile_timeout,
            oracle: RegressionOracle::new(reliable),
        }
    }
}

impl TestHarness for SuiteHarness {
    type Oracle = RegressionOracle;

    fn oracle(&self) -> &RegressionOracle {
        &self.oracle
    }

    fn oracle_name(&self) -> &'static str {
        "suite"
    }

    fn next_test(&mut self, _work: &Path) -> Result<NextTest, HarnessError> {
        Ok(match self.queries.pop_front() {
            Some(query) => NextTest::Ready(TestCase {
                name: query_test_name(&query),
                label: query,
            }),
            None => NextTest::Exhausted,
        })
    }

    fn baseline(
        &mut self,
        test: &TestCase,
        _work: &Path,
    ) -> Result<BaselineOutcome<SubtestOutcomes>, HarnessError> {
        let spec = self.env.unmutated(self.mutated.for_query(&test.label));
        let result = match run_with_timeout(&spec, self.run_timeout)? {
            RunOutcome::TimedOut => {
                return Ok(BaselineOutcome::Abandon(
                    "runtime timeout without mutants".to_string(),
                ));
            }
            RunOutcome::Completed(result) => result,
        };
        let outcomes = parse_subtest_outcomes(&result.stdout_text())?;
        if self.oracle.eligible(&outcomes).is_empty() {
            return Ok(BaselineOutcome::Abandon(format!(
                "no reliable sub-test passes without mutants ({} sub-tests ran)",
                outcomes.len()
            )));
        }
        Ok(BaselineOutcome::Usable(outcomes))
    }

    fn coverage(&mut self, test: &TestCase, work: &Path) -> Result<CoverageOutcome, HarnessError> {
        let tracking_file = work.join(TRACKING_FILE);
        let spec = self
            .env
            .tracking(self.tracking.for_query(&test.label), &tracking_file);
        let outcome = run_with_timeout(&spec, self.compile_timeout)?;
        collect_tracking(outcome, &tracking_file)
    }

    fn trial(
        &mut self,
        test: &TestCase,
        _work: &Path,
        mutation: MutationId,
    ) -> Result<SuiteTrial, HarnessError> {
        let spec = self
            .env
            .mutated(self.mutated.for_query(&test.label), mutation);
        Ok(match run_with_timeout(&spec, self.compile_timeout)? {
            RunOutcome::TimedOut => SuiteTrial::TimedOut,
            RunOutcome::Completed(result) => {
                SuiteTrial::Completed(parse_subtest_outcomes(&result.stdout_text())?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::subtests::SubtestStatus;

    #[test]
    fn query_names_drop_wildcards() {
        assert_eq!(
            query_test_name("webgpu:shader,execution,flow_control,loop:*"),
            "webgpu-shader,execution,flow_control,loop-"
        );
    }

    #[test]
    fn query_lists_load_from_json() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let path = tmp.path().join("queries.json");
        std::fs::write(&path, r#"["a:*", "b:c"]"#).expect("query file should write");
        assert_eq!(
            load_queries(&path).expect("queries should load"),
            vec!["a:*".to_string(), "b:c".to_string()]
        );
        std::fs::write(&path, "{}").expect("query file should write");
        assert!(matches!(
            load_queries(&path),
            Err(HarnessError::Queries { .. })
        ));
    }

    #[cfg(unix)]
    fn runner_script(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        // t1 passes unless mutation 4 is on; t2 passes only on the first run;
        // the tracking build reports 4 and 9.
        let script = dir.join("run-suite.sh");
        std::fs::write(
            &script,
            r#"#!/bin/sh
if [ -n "$DREDD_MUTANT_TRACKING_FILE" ]; then printf '4\n9\n' > "$DREDD_MUTANT_TRACKING_FILE"; fi
if [ "$DREDD_ENABLED_MUTATION" = 4 ]; then echo "t1 - fail"; else echo "t1 - pass"; fi
if [ -f "$(dirname "$0")/flaky" ]; then echo "t2 - fail"; else echo "t2 - pass"; touch "$(dirname "$0")/flaky"; fi
echo "t3 - skip"
"#,
        )
        .expect("runner script should write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("script should be executable");
        script
    }

    #[cfg(unix)]
    #[test]
    fn reliable_finder_drops_flaky_subtests() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let runner = SuiteCommand::new(runner_script(tmp.path()));
        let env = MutantEnv::from_config(&CampaignConfig::default());
        let reliable = find_reliable_subtests(
            &runner,
            &["q:*".to_string()],
            3,
            Duration::from_secs(10),
            &env,
        )
        .expect("finder should run");
        assert_eq!(reliable, BTreeSet::from(["t1".to_string()]));
    }

    #[cfg(unix)]
    #[test]
    fn suite_harness_runs_three_builds() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).expect("work dir should be created");
        let runner = SuiteCommand::new(runner_script(tmp.path())).with_args(["run-cts", "--verbose"]);
        let mut harness = SuiteHarness::new(
            ["q:*".to_string()],
            runner.clone(),
            runner,
            BTreeSet::from(["t1".to_string()]),
            &CampaignConfig::default(),
        );

        let test = match harness.next_test(&work).expect("queries are in memory") {
            NextTest::Ready(test) => test,
            other => panic!("expected a query, got {other:?}"),
        };
        assert_eq!(test.name, "q-");
        let baseline = match harness.baseline(&test, &work).expect("baseline should run") {
            BaselineOutcome::Usable(outcomes) => outcomes,
            BaselineOutcome::Abandon(reason) => panic!("baseline abandoned: {reason}"),
        };
        assert_eq!(baseline.get("t3"), Some(&SubtestStatus::Skip));

        assert_eq!(
            harness.coverage(&test, &work).expect("coverage should run"),
            CoverageOutcome::Tracked(b"4\n9\n".to_vec())
        );
        match harness.trial(&test, &work, 4).expect("trial should run") {
            SuiteTrial::Completed(outcomes) => {
                assert_eq!(outcomes.get("t1"), Some(&SubtestStatus::Fail));
            }
            SuiteTrial::TimedOut => panic!("trial should not time out"),
        }
        assert_eq!(
            harness.next_test(&work).expect("queries are in memory"),
            NextTest::Exhausted
        );
    }
}
