//! Campaign configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::tree::MutationId;

/// Default selector variable read by the mutated and tracking builds.
pub const DEFAULT_ENABLED_MUTATION_ENV: &str = "DREDD_ENABLED_MUTATION";
/// Default variable naming the tracking build's output file.
pub const DEFAULT_TRACKING_FILE_ENV: &str = "DREDD_MUTANT_TRACKING_FILE";

const ONE_DAY: Duration = Duration::from_secs(86_400);

/// Configuration shared by every worker of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignConfig {
    /// Root of the shared kill-tracking store.
    pub kill_root: PathBuf,
    /// Budget for compiling (or compiling and running) one mutated test.
    pub compile_timeout: Duration,
    /// Budget for one baseline run.
    pub run_timeout: Duration,
    /// Budget for generating one fuzzer program.
    pub generator_timeout: Duration,
    /// Stop after this much campaign time. Zero means unbounded.
    pub total_test_time: Duration,
    /// Stop when no kill happened for this long. Zero means unbounded.
    pub maximum_time_since_last_kill: Duration,
    /// Restrict candidates to these ids.
    pub mutants_to_kill: Option<BTreeSet<MutationId>>,
    /// Variable that selects the enabled mutation id.
    pub enabled_mutation_env: String,
    /// Variable that names the tracking output file.
    pub tracking_file_env: String,
    /// Extra variables passed to every subprocess.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let kill_root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("mutant-kill-info");
        Self {
            kill_root,
            compile_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(60),
            generator_timeout: Duration::from_secs(20),
            total_test_time: ONE_DAY,
            maximum_time_since_last_kill: ONE_DAY,
            mutants_to_kill: None,
            enabled_mutation_env: DEFAULT_ENABLED_MUTATION_ENV.to_string(),
            tracking_file_env: DEFAULT_TRACKING_FILE_ENV.to_string(),
            extra_env: BTreeMap::new(),
        }
    }
}

impl CampaignConfig {
    /// Set the kill-tracking root.
    pub fn with_kill_root(mut self, kill_root: impl Into<PathBuf>) -> Self {
        self.kill_root = kill_root.into();
        self
    }

    /// Set the compile budget.
    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    /// Set the baseline run budget.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set the generator budget.
    pub fn with_generator_timeout(mut self, timeout: Duration) -> Self {
        self.generator_timeout = timeout;
        self
    }

    /// Set the total campaign budget.
    pub fn with_total_test_time(mut self, limit: Duration) -> Self {
        self.total_test_time = limit;
        self
    }

    /// Set the no-recent-kill budget.
    pub fn with_maximum_time_since_last_kill(mut self, limit: Duration) -> Self {
        self.maximum_time_since_last_kill = limit;
        self
    }

    /// Only try these mutation ids.
    pub fn with_mutants_to_kill(mut self, ids: impl IntoIterator<Item = MutationId>) -> Self {
        self.mutants_to_kill = Some(ids.into_iter().collect());
        self
    }

    /// Override the selector variable name.
    pub fn with_enabled_mutation_env(mut self, name: impl Into<String>) -> Self {
        self.enabled_mutation_env = name.into();
        self
    }

    /// Override the tracking-file variable name.
    pub fn with_tracking_file_env(mut self, name: impl Into<String>) -> Self {
        self.tracking_file_env = name.into();
        self
    }

    /// Add one variable passed to every subprocess.
    pub fn with_extra_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// True if `id` may be tried under the target allow-list.
    pub fn is_target(&self, id: MutationId) -> bool {
        self.mutants_to_kill
            .as_ref()
            .is_none_or(|targets| targets.contains(&id))
    }
}
