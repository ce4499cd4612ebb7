use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use mutant_campaign::campaign::{
    CampaignConfig, CampaignOutcome, CampaignReport, FuzzHarness, FuzzSettings, Journal, Ledger,
    MutantEnv, MutationTree, ReportFormat, Scheduler, SuiteCommand, SuiteHarness, TestHarness,
    find_reliable_subtests, load_matching_trees, load_queries, load_reliable_subtests,
    replay_all, save_reliable_subtests,
};

/// Set in re-executed children so they run as a single worker.
const WORKER_INDEX_ENV: &str = "MUTANT_CAMPAIGN_WORKER_INDEX";

#[derive(Debug, Parser)]
#[command(name = "mutant-campaign")]
#[command(about = "Find tests that kill compiler mutants", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Kill mutants with generated programs under the differential oracle.
    Fuzz {
        #[command(flatten)]
        campaign: CampaignArgs,
        /// Fuzzer executable (`gen`, `recondition`, `run`).
        #[arg(long)]
        fuzzer: PathBuf,
        /// Runner built against the mutated compiler.
        #[arg(long)]
        mutated_runner: PathBuf,
        /// Runner built against the coverage-tracking compiler.
        #[arg(long)]
        tracking_runner: PathBuf,
        /// Backend passed to every run with `-c`.
        #[arg(long, default_value = "dawn:vk:7425")]
        driver: String,
        /// Seed for choosing program seeds.
        #[arg(long)]
        seed: Option<u64>,
        /// Stop each worker after this many generated programs.
        #[arg(long)]
        max_tests: Option<usize>,
        /// Budget for one fuzzer step, in seconds.
        #[arg(long, env = "MUTANT_CAMPAIGN_GENERATOR_TIMEOUT")]
        generator_timeout: Option<u64>,
    },
    /// Kill mutants with conformance-suite queries under the regression oracle.
    Suite {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[command(flatten)]
        runner: RunnerArgs,
        /// Runner built against the coverage-tracking compiler.
        #[arg(long)]
        tracking_runner: PathBuf,
        /// Reliable sub-test list written by `reliable`.
        #[arg(long)]
        reliable_tests: PathBuf,
    },
    /// Run queries repeatedly without mutants and keep the sub-tests that always pass.
    Reliable {
        #[command(flatten)]
        runner: RunnerArgs,
        /// Number of runs per query.
        #[arg(long, default_value_t = 3)]
        runs: usize,
        /// Budget for one query run, in seconds.
        #[arg(long, default_value_t = 60, env = "MUTANT_CAMPAIGN_RUN_TIMEOUT")]
        run_timeout: u64,
        /// Where to write the list.
        #[arg(long, default_value = "reliable_tests.json")]
        output: PathBuf,
        #[command(flatten)]
        env: EnvArgs,
    },
    /// Aggregate a kill root.
    Report {
        /// Kill-tracking root.
        #[arg(long, env = "MUTANT_CAMPAIGN_KILL_ROOT")]
        kill_root: Option<PathBuf>,
        /// Mutation description, for the kill ratio.
        #[arg(long)]
        mutation_info: Option<PathBuf>,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
    },
    /// Show what each worker's journal says.
    Status {
        /// Kill-tracking root.
        #[arg(long, env = "MUTANT_CAMPAIGN_KILL_ROOT")]
        kill_root: Option<PathBuf>,
    },
    /// Check that the mutation and coverage-tracking descriptions agree.
    CheckTrees {
        /// Description of the mutated build.
        mutation_info: PathBuf,
        /// Description of the coverage-tracking build.
        tracking_info: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

#[derive(Debug, Args)]
struct CampaignArgs {
    /// Description of the mutated build.
    mutation_info: PathBuf,
    /// Description of the coverage-tracking build.
    tracking_info: PathBuf,
    /// Kill-tracking root shared by every worker.
    #[arg(long, env = "MUTANT_CAMPAIGN_KILL_ROOT")]
    kill_root: Option<PathBuf>,
    /// Budget for one mutated or tracking run, in seconds.
    #[arg(long, env = "MUTANT_CAMPAIGN_COMPILE_TIMEOUT")]
    compile_timeout: Option<u64>,
    /// Budget for one baseline run, in seconds.
    #[arg(long, env = "MUTANT_CAMPAIGN_RUN_TIMEOUT")]
    run_timeout: Option<u64>,
    /// Stop after this many seconds; 0 means never.
    #[arg(long, env = "MUTANT_CAMPAIGN_TOTAL_TEST_TIME")]
    total_test_time: Option<u64>,
    /// Stop after this many seconds without a kill; 0 means never.
    #[arg(long, env = "MUTANT_CAMPAIGN_MAXIMUM_TIME_SINCE_LAST_KILL")]
    maximum_time_since_last_kill: Option<u64>,
    /// Only try these mutation ids.
    #[arg(long, value_delimiter = ',')]
    mutants_to_kill: Vec<u32>,
    /// Independent worker processes to run.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Only survey coverage of this many tests; nothing is killed.
    #[arg(long, value_name = "N")]
    coverage_survey: Option<usize>,
    /// Where the coverage survey is written.
    #[arg(long, default_value = "coverage_survey.json")]
    survey_output: PathBuf,
    #[command(flatten)]
    env: EnvArgs,
}

#[derive(Debug, Args)]
struct EnvArgs {
    /// Variable that selects the enabled mutation.
    #[arg(long)]
    enabled_mutation_env: Option<String>,
    /// Variable that names the tracking output file.
    #[arg(long)]
    tracking_file_env: Option<String>,
    /// Extra `KEY=VALUE` passed to every subprocess.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    extra_env: Vec<(String, String)>,
}

#[derive(Debug, Args)]
struct RunnerArgs {
    /// Conformance-suite runner built against the mutated compiler.
    #[arg(long)]
    runner: PathBuf,
    /// Argument placed before the query; repeatable.
    #[arg(long = "runner-arg", allow_hyphen_values = true)]
    runner_args: Vec<OsString>,
    /// JSON list of queries.
    #[arg(long, required_unless_present = "query")]
    queries: Option<PathBuf>,
    /// Single query.
    #[arg(long, conflicts_with = "queries")]
    query: Option<String>,
}

impl RunnerArgs {
    fn command(&self, program: &Path) -> SuiteCommand {
        SuiteCommand::new(program).with_args(self.runner_args.iter().cloned())
    }

    fn queries(&self) -> Result<Vec<String>> {
        match (&self.queries, &self.query) {
            (Some(path), _) => Ok(load_queries(path)?),
            (None, Some(query)) => Ok(vec![query.clone()]),
            (None, None) => bail!("either --queries or --query is required"),
        }
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn apply_env(mut config: CampaignConfig, env: &EnvArgs) -> CampaignConfig {
    if let Some(name) = &env.enabled_mutation_env {
        config = config.with_enabled_mutation_env(name);
    }
    if let Some(name) = &env.tracking_file_env {
        config = config.with_tracking_file_env(name);
    }
    for (key, value) in &env.extra_env {
        config = config.with_extra_env(key, value);
    }
    config
}

fn make_config(args: &CampaignArgs) -> CampaignConfig {
    let mut config = CampaignConfig::default();
    if let Some(kill_root) = &args.kill_root {
        config = config.with_kill_root(kill_root);
    }
    if let Some(secs) = args.compile_timeout {
        config = config.with_compile_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.run_timeout {
        config = config.with_run_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.total_test_time {
        config = config.with_total_test_time(Duration::from_secs(secs));
    }
    if let Some(secs) = args.maximum_time_since_last_kill {
        config = config.with_maximum_time_since_last_kill(Duration::from_secs(secs));
    }
    if !args.mutants_to_kill.is_empty() {
        config = config.with_mutants_to_kill(args.mutants_to_kill.iter().copied());
    }
    apply_env(config, &args.env)
}

fn kill_root_or_default(kill_root: Option<PathBuf>) -> PathBuf {
    match kill_root {
        Some(kill_root) => kill_root,
        None => CampaignConfig::default().kill_root,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn install_interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install the interrupt handler")?;
    Ok(flag)
}

fn worker_index() -> Option<usize> {
    std::env::var(WORKER_INDEX_ENV).ok()?.parse().ok()
}

/// Re-execute this command `workers` times and wait for every child.
fn fan_out(workers: usize) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    // workers see the same Ctrl-C; the parent only waits for them
    let _interrupted = install_interrupt_flag()?;
    let mut children = Vec::with_capacity(workers);
    for index in 0..workers {
        let child = std::process::Command::new(&exe)
            .args(&args)
            .env(WORKER_INDEX_ENV, index.to_string())
            .spawn()
            .with_context(|| format!("failed to start worker {index}"))?;
        tracing::info!(index, pid = child.id(), "worker spawned");
        children.push((index, child));
    }

    let mut failed = Vec::new();
    for (index, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for worker {index}"))?;
        if !status.success() {
            tracing::warn!(index, %status, "worker failed");
            failed.push(index);
        }
    }
    if !failed.is_empty() {
        bail!("workers {failed:?} failed");
    }
    println!("workers finished: {workers}");
    Ok(())
}

fn print_outcome(outcome: &CampaignOutcome) {
    println!(
        "summary: kills={}, tests={}, abandoned={}, skipped={}, lost_races={}, stop_reason={:?}",
        outcome.kills.len(),
        outcome.tests_summarized,
        outcome.tests_abandoned,
        outcome.tests_skipped,
        outcome.lost_races,
        outcome.stop_reason
    );
}

fn run_campaign<H: TestHarness>(
    harness: H,
    tree: &MutationTree,
    config: CampaignConfig,
    args: &CampaignArgs,
) -> Result<()> {
    let ledger = Ledger::open(&config.kill_root);
    let stop = install_interrupt_flag()?;

    if let Some(limit) = args.coverage_survey {
        let mut scheduler = Scheduler::new(harness, &ledger, config)?.with_stop_flag(stop);
        let surveyed = scheduler.survey_coverage(limit)?;
        let json = serde_json::to_string_pretty(&surveyed)?;
        std::fs::write(&args.survey_output, json)
            .with_context(|| format!("failed to write {}", args.survey_output.display()))?;
        println!(
            "surveyed {} tests into {}",
            surveyed.len(),
            args.survey_output.display()
        );
        return Ok(());
    }

    let journal = Journal::for_worker(&config.kill_root, std::process::id())?;
    let mut scheduler = Scheduler::new(harness, &ledger, config)?
        .with_journal(journal)
        .with_stop_flag(stop);
    let outcome = scheduler.run(tree)?;
    print_outcome(&outcome);
    Ok(())
}

/// Load and check the descriptions, then either fan out or run here.
fn campaign_setup(args: &CampaignArgs) -> Result<Option<MutationTree>> {
    let tree = load_matching_trees(&args.mutation_info, &args.tracking_info)?;
    if args.workers > 1 && args.coverage_survey.is_none() && worker_index().is_none() {
        fan_out(args.workers)?;
        return Ok(None);
    }
    Ok(Some(tree))
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Fuzz {
            campaign,
            fuzzer,
            mutated_runner,
            tracking_runner,
            driver,
            seed,
            max_tests,
            generator_timeout,
        } => {
            let Some(tree) = campaign_setup(&campaign)? else {
                return Ok(());
            };
            let mut config = make_config(&campaign);
            if let Some(secs) = generator_timeout {
                config = config.with_generator_timeout(Duration::from_secs(secs));
            }
            let settings = FuzzSettings {
                driver,
                // each worker draws a different program sequence
                seed: seed.map(|seed| seed.wrapping_add(worker_index().unwrap_or(0) as u64)),
                max_tests,
                ..FuzzSettings::new(fuzzer, mutated_runner, tracking_runner)
            };
            let harness = FuzzHarness::new(settings, &config);
            run_campaign(harness, &tree, config, &campaign)?;
        }
        Command::Suite {
            campaign,
            runner,
            tracking_runner,
            reliable_tests,
        } => {
            let Some(tree) = campaign_setup(&campaign)? else {
                return Ok(());
            };
            let config = make_config(&campaign);
            let reliable = load_reliable_subtests(&reliable_tests)
                .with_context(|| format!("failed to load {}", reliable_tests.display()))?;
            let harness = SuiteHarness::new(
                runner.queries()?,
                runner.command(&runner.runner),
                runner.command(&tracking_runner),
                reliable,
                &config,
            );
            run_campaign(harness, &tree, config, &campaign)?;
        }
        Command::Reliable {
            runner,
            runs,
            run_timeout,
            output,
            env,
        } => {
            let config = apply_env(CampaignConfig::default(), &env);
            let reliable = find_reliable_subtests(
                &runner.command(&runner.runner),
                &runner.queries()?,
                runs,
                Duration::from_secs(run_timeout),
                &MutantEnv::from_config(&config),
            )?;
            save_reliable_subtests(&output, &reliable)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("reliable sub-tests: {} -> {}", reliable.len(), output.display());
        }
        Command::Report {
            kill_root,
            mutation_info,
            format,
        } => {
            let ledger = Ledger::open(kill_root_or_default(kill_root));
            let num_mutations = match mutation_info {
                Some(path) => Some(MutationTree::from_path(&path)?.num_mutations()),
                None => None,
            };
            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
            };
            let report = CampaignReport::collect(&ledger, num_mutations)?;
            println!("{}", report.render(format)?);
        }
        Command::Status { kill_root } => {
            let kill_root = kill_root_or_default(kill_root);
            let workers = replay_all(&kill_root)?;
            if workers.is_empty() {
                println!("no journals under {}", kill_root.display());
            }
            for (path, snapshot) in workers {
                println!("journal: {}", path.display());
                if let Some(pid) = snapshot.pid {
                    println!("  pid: {pid}");
                }
                if let Some(oracle) = &snapshot.oracle {
                    println!("  oracle: {oracle}");
                }
                println!(
                    "  tests: started={}, summarized={}, terminated_early={}, abandoned={}, skipped={}",
                    snapshot.tests_started.len(),
                    snapshot.tests_summarized.len(),
                    snapshot.tests_terminated_early.len(),
                    snapshot.tests_abandoned.len(),
                    snapshot.tests_skipped
                );
                println!(
                    "  mutants: tried={}, kills={}, lost_races={}",
                    snapshot.mutants_tried,
                    snapshot.kills.len(),
                    snapshot.lost_races
                );
                match snapshot.stop_reason {
                    Some(reason) => println!("  stopped: {reason:?}"),
                    None => println!("  stopped: no (running or crashed)"),
                }
                for test in snapshot.in_flight_tests() {
                    println!("  in flight: {test}");
                }
                if snapshot.malformed_lines > 0 {
                    println!("  malformed lines: {}", snapshot.malformed_lines);
                }
            }
        }
        Command::CheckTrees {
            mutation_info,
            tracking_info,
        } => {
            let tree = load_matching_trees(&mutation_info, &tracking_info)?;
            println!("nodes: {}", tree.num_nodes());
            println!("mutations: {}", tree.num_mutations());
            println!("unowned ids: {}", tree.unowned_mutation_ids().len());
        }
    }

    Ok(())
}
