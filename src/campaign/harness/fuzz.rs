//! Program-fuzzer harness: generated programs under the differential oracle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    BaselineOutcome, CoverageOutcome, HarnessError, MutantEnv, NextTest, TRACKING_FILE,
    TestCase, TestHarness, collect_tracking,
};
use crate::campaign::config::CampaignConfig;
use crate::campaign::oracle::{DifferentialOracle, ProgramTrial};
use crate::campaign::outputs::{ProgramOutput, parse_program_output};
use crate::campaign::process::{CommandSpec, ExecutionResult, RunOutcome, run_with_timeout};
use crate::campaign::tree::MutationId;

const PROGRAM_FILE: &str = "prog.wgsl";
const RECONDITIONED_FILE: &str = "reconditioned.wgsl";
const INPUTS_FILE: &str = "inputs.json";
/// Comment prefix in front of the inputs on a generated program's first line.
const INPUTS_PREFIX_CHARS: usize = 3;

/// Executables and options for the fuzz harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzSettings {
    /// Fuzzer executable; provides `gen`, `recondition` and the reference `run`.
    pub fuzzer: PathBuf,
    /// Runner built against the mutated compiler.
    pub mutated_runner: PathBuf,
    /// Runner built against the coverage-tracking compiler.
    pub tracking_runner: PathBuf,
    /// Backend passed with `-c`.
    pub driver: String,
    /// Seed for choosing test seeds; random when absent.
    pub seed: Option<u64>,
    /// Stop after this many generated tests.
    pub max_tests: Option<usize>,
}

impl FuzzSettings {
    /// Settings with the default driver and no limits.
    pub fn new(
        fuzzer: impl Into<PathBuf>,
        mutated_runner: impl Into<PathBuf>,
        tracking_runner: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fuzzer: fuzzer.into(),
            mutated_runner: mutated_runner.into(),
            tracking_runner: tracking_runner.into(),
            driver: "dawn:vk:7425".to_string(),
            seed: None,
            max_tests: None,
        }
    }
}

/// Fuzz harness.
#[derive(Debug)]
pub struct FuzzHarness {
    settings: FuzzSettings,
    env: MutantEnv,
    generator_timeout: Duration,
    run_timeout: Duration,
    compile_timeout: Duration,
    rng: fastrand::Rng,
    generated: usize,
    oracle: DifferentialOracle,
}

impl FuzzHarness {
    /// Harness for `settings` under `config`'s budgets and environment.
    pub fn new(settings: FuzzSettings, config: &CampaignConfig) -> Self {
        let rng = match settings.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            env: MutantEnv::from_config(config),
            generator_timeout: config.generator_timeout,
            run_timeout: config.run_timeout,
            compile_timeout: config.compile_timeout,
            rng,
            generated: 0,
            oracle: DifferentialOracle::default(),
            settings,
        }
    }

    fn run_args(&self, work: &Path) -> Vec<std::ffi::OsString> {
        vec![
            "run".into(),
            work.join(RECONDITIONED_FILE).into_os_string(),
            work.join(INPUTS_FILE).into_os_string(),
            "-c".into(),
            self.settings.driver.clone().into(),
        ]
    }

    fn generator_step(&self, args: Vec<std::ffi::OsString>, seed: u32) -> Result<Option<String>, HarnessError> {
        let spec = self
            .env
            .unmutated(CommandSpec::new(&self.settings.fuzzer).args(args));
        Ok(match run_with_timeout(&spec, self.generator_timeout)? {
            RunOutcome::TimedOut => Some(format!("fuzzer timed out (seed {seed})")),
            RunOutcome::Completed(result) if !result.success() => Some(format!(
                "fuzzer exited with {} (seed {seed})",
                result.exit_code
            )),
            RunOutcome::Completed(_) => None,
        })
    }
}

/// Inputs carried on the first line of a generated program.
fn extract_inputs(program: &str) -> &str {
    let first = program.lines().next().unwrap_or_default();
    match first.char_indices().nth(INPUTS_PREFIX_CHARS) {
        Some((start, _)) => &first[start..],
        None => "",
    }
}

fn usable_baseline(result: ExecutionResult) -> BaselineOutcome<ExecutionResult> {
    if !result.success() {
        return BaselineOutcome::Abandon(format!(
            "program failed without mutants (exit {})",
            result.exit_code
        ));
    }
    match parse_program_output(&result.stdout) {
        Ok(ProgramOutput::Values(_)) => BaselineOutcome::Usable(result),
        Ok(ProgramOutput::Timeout) => {
            BaselineOutcome::Abandon("program reported a timeout without mutants".to_string())
        }
        Err(err) => BaselineOutcome::Abandon(format!("unmutated output unreadable: {err}")),
    }
}

impl TestHarness for FuzzHarness {
    type Oracle = DifferentialOracle;

    fn oracle(&self) -> &DifferentialOracle {
        &self.oracle
    }

    fn oracle_name(&self) -> &'static str {
        "program"
    }

    fn next_test(&mut self, work: &Path) -> Result<NextTest, HarnessError> {
        if self
            .settings
            .max_tests
            .is_some_and(|max| self.generated >= max)
        {
            return Ok(NextTest::Exhausted);
        }
        self.generated += 1;

        let seed = self.rng.u32(..);
        let program = work.join(PROGRAM_FILE);
        if let Some(reason) = self.generator_step(
            vec!["gen".into(), "-o".into(), program.clone().into_os_string()],
            seed,
        )? {
            return Ok(NextTest::Retry(reason));
        }

        let text = match std::fs::read_to_string(&program) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(NextTest::Retry(format!("fuzzer wrote no program (seed {seed})")));
            }
            Err(source) => return Err(HarnessError::Io { path: program, source }),
        };
        let inputs = work.join(INPUTS_FILE);
        std::fs::write(&inputs, extract_inputs(&text)).map_err(HarnessError::io(&inputs))?;

        if let Some(reason) = self.generator_step(
            vec![
                "recondition".into(),
                program.into_os_string(),
                work.join(RECONDITIONED_FILE).into_os_string(),
            ],
            seed,
        )? {
            return Ok(NextTest::Retry(reason));
        }

        Ok(NextTest::Ready(TestCase {
            name: format!("fuzz_{seed}"),
            label: format!("seed {seed}"),
        }))
    }

    fn baseline(
        &mut self,
        _test: &TestCase,
        work: &Path,
    ) -> Result<BaselineOutcome<ExecutionResult>, HarnessError> {
        let spec = self
            .env
            .unmutated(CommandSpec::new(&self.settings.fuzzer).args(self.run_args(work)));
        Ok(match run_with_timeout(&spec, self.run_timeout)? {
            RunOutcome::TimedOut => BaselineOutcome::Abandon("runtime timeout without mutants".to_string()),
            RunOutcome::Completed(result) => usable_baseline(result),
        })
    }

    fn coverage(&mut self, _test: &TestCase, work: &Path) -> Result<CoverageOutcome, HarnessError> {
        let tracking_file = work.join(TRACKING_FILE);
        let spec = self.env.tracking(
            CommandSpec::new(&self.settings.tracking_runner).args(self.run_args(work)),
            &tracking_file,
        );
        let outcome = run_with_timeout(&spec, self.compile_timeout)?;
        collect_tracking(outcome, &tracking_file)
    }

    fn trial(
        &mut self,
        _test: &TestCase,
        work: &Path,
        mutation: MutationId,
    ) -> Result<ProgramTrial, HarnessError> {
        let spec = self.env.mutated(
            CommandSpec::new(&self.settings.mutated_runner).args(self.run_args(work)),
            mutation,
        );
        // compiling and running happen in one process
        Ok(match run_with_timeout(&spec, self.compile_timeout)? {
            RunOutcome::TimedOut => ProgramTrial::CompileTimedOut,
            RunOutcome::Completed(result) if !result.success() => ProgramTrial::CompileFailed(result),
            RunOutcome::Completed(result) => ProgramTrial::Executed(RunOutcome::Completed(result)),
        })
    }

    fn artifacts(&self, _test: &TestCase, work: &Path) -> Result<Vec<(String, Vec<u8>)>, HarnessError> {
        let program = work.join(PROGRAM_FILE);
        let bytes = std::fs::read(&program).map_err(HarnessError::io(&program))?;
        Ok(vec![(PROGRAM_FILE.to_string(), bytes)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn inputs_follow_the_comment_prefix() {
        assert_eq!(
            extract_inputs("// {\"0:0\":[1,2]}\nfn main() {}\n"),
            "{\"0:0\":[1,2]}"
        );
        assert_eq!(extract_inputs("//"), "");
        assert_eq!(extract_inputs(""), "");
    }

    #[test]
    fn baseline_requires_clean_parseable_run() {
        assert!(matches!(
            usable_baseline(result(0, "outputs = [1]")),
            BaselineOutcome::Usable(_)
        ));
        assert!(matches!(
            usable_baseline(result(1, "outputs = [1]")),
            BaselineOutcome::Abandon(_)
        ));
        assert!(matches!(
            usable_baseline(result(0, "timeout")),
            BaselineOutcome::Abandon(_)
        ));
        assert!(matches!(
            usable_baseline(result(0, "no section")),
            BaselineOutcome::Abandon(_)
        ));
    }

    #[test]
    fn seeded_harness_is_reproducible() {
        let config = CampaignConfig::default();
        let settings = FuzzSettings {
            seed: Some(9),
            ..FuzzSettings::new("fuzzer", "mutated", "tracking")
        };
        let mut a = FuzzHarness::new(settings.clone(), &config);
        let mut b = FuzzHarness::new(settings, &config);
        assert_eq!(a.rng.u32(..), b.rng.u32(..));
    }

    #[cfg(unix)]
    #[test]
    fn generation_and_trials_use_the_fuzzer_contract() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).expect("work dir should be created");
        let fuzzer = tmp.path().join("fuzzer.sh");
        std::fs::write(
            &fuzzer,
            r#"#!/bin/sh
case "$1" in
  gen) printf '// [7]\nfn main() {}\n' > "$3" ;;
  recondition) cp "$2" "$3" ;;
  run) echo "outputs = [7]" ;;
esac
"#,
        )
        .expect("fuzzer script should write");
        let mutated = tmp.path().join("mutated.sh");
        std::fs::write(
            &mutated,
            "#!/bin/sh\nif [ \"$DREDD_ENABLED_MUTATION\" = 2 ]; then exit 3; fi\necho \"outputs = [7]\"\n",
        )
        .expect("mutated script should write");
        for script in [&fuzzer, &mutated] {
            std::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755))
                .expect("script should be executable");
        }

        let settings = FuzzSettings {
            seed: Some(1),
            max_tests: Some(1),
            ..FuzzSettings::new(&fuzzer, &mutated, &mutated)
        };
        let mut harness = FuzzHarness::new(settings, &CampaignConfig::default());
        let test = match harness.next_test(&work).expect("generation should run") {
            NextTest::Ready(test) => test,
            other => panic!("expected a test, got {other:?}"),
        };
        assert!(test.name.starts_with("fuzz_"));
        assert_eq!(
            std::fs::read_to_string(work.join(INPUTS_FILE)).expect("inputs should exist"),
            "[7]"
        );
        assert_eq!(
            harness.next_test(&work).expect("limit should apply"),
            NextTest::Exhausted
        );

        let baseline = match harness.baseline(&test, &work).expect("baseline should run") {
            BaselineOutcome::Usable(result) => result,
            BaselineOutcome::Abandon(reason) => panic!("baseline abandoned: {reason}"),
        };
        assert!(matches!(
            harness.trial(&test, &work, 2).expect("trial should run"),
            ProgramTrial::CompileFailed(_)
        ));
        let survived = harness.trial(&test, &work, 1).expect("trial should run");
        assert_eq!(survived, ProgramTrial::Executed(RunOutcome::Completed(baseline)));
        assert_eq!(
            harness.artifacts(&test, &work).expect("program should be kept")[0].0,
            "prog.wgsl"
        );
    }
}
