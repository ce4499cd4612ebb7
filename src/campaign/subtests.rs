//! Conformance-suite sub-test outcomes and the reliable-sub-test classifier.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of one sub-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtestStatus {
    /// Passed.
    Pass,
    /// Failed.
    Fail,
    /// Skipped.
    Skip,
}

impl SubtestStatus {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// Sub-test name to status, as reported by one suite run.
pub type SubtestOutcomes = BTreeMap<String, SubtestStatus>;

/// Errors reading runner output or reliable-test lists.
#[derive(Debug, Error)]
pub enum SubtestParseError {
    /// A status line carried something other than pass/fail/skip.
    #[error("line {line}: unrecognised sub-test status {status:?}")]
    UnknownStatus {
        /// 1-based line number.
        line: usize,
        /// Status text as found.
        status: String,
    },
    /// Reliable-test list I/O.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Reliable-test list is not a JSON array of names.
    #[error("invalid reliable-test list: {0}")]
    Json(#[from] serde_json::Error),
}

const STATUS_MARKERS: [&str; 3] = [" - pass", " - fail", " - skip"];

/// Extract the sub-test outcome map from runner stdout.
///
/// A status line contains ` - pass`, ` - fail` or ` - skip`; the sub-test name
/// is the text before the first space and the status is the text after the
/// first ` - `, with `:` removed and trimmed. Any other status on such a line
/// is an inconsistency and fails the parse.
pub fn parse_subtest_outcomes(stdout: &str) -> Result<SubtestOutcomes, SubtestParseError> {
    let mut outcomes = SubtestOutcomes::new();
    for (index, line) in stdout.lines().enumerate() {
        if !STATUS_MARKERS.iter().any(|marker| line.contains(marker)) {
            continue;
        }
        let (Some(name_end), Some(status_start)) = (line.find(' '), line.find(" - ")) else {
            continue;
        };
        let status_text = line[status_start + 3..].replace(':', "");
        let status_text = status_text.trim();
        let status =
            SubtestStatus::parse(status_text).ok_or_else(|| SubtestParseError::UnknownStatus {
                line: index + 1,
                status: status_text.to_string(),
            })?;
        outcomes.insert(line[..name_end].to_string(), status);
    }
    Ok(outcomes)
}

/// Names with the given status.
pub fn with_status(outcomes: &SubtestOutcomes, status: SubtestStatus) -> BTreeSet<String> {
    outcomes
        .iter()
        .filter(|(_, s)| **s == status)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Sub-tests that passed in every one of `runs`.
///
/// An empty slice yields an empty set: nothing has been shown to pass.
pub fn reliable_subtests(runs: &[SubtestOutcomes]) -> BTreeSet<String> {
    let Some((first, rest)) = runs.split_first() else {
        return BTreeSet::new();
    };
    let mut reliable = with_status(first, SubtestStatus::Pass);
    for run in rest {
        reliable.retain(|name| run.get(name) == Some(&SubtestStatus::Pass));
    }
    reliable
}

/// Load a reliable-test list (JSON array of names).
pub fn load_reliable_subtests(path: &Path) -> Result<BTreeSet<String>, SubtestParseError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write a reliable-test list (JSON array of names, sorted).
pub fn save_reliable_subtests(
    path: &Path,
    reliable: &BTreeSet<String>,
) -> Result<(), SubtestParseError> {
    let json = serde_json::to_string_pretty(reliable)?;
    std::fs::write(path, json)?;
    Ok(())
}
