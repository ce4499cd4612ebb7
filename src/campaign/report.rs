//! Aggregate view of a kill root.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use super::ledger::{ClaimStore, Ledger, LedgerError, TrackingRecord};
use super::tree::MutationId;

/// Supported output formats for campaign reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON with every list inline.
    Json,
}

/// Everything the shared store says about a campaign so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignReport {
    /// Mutations in the description, when one was given.
    pub num_mutations: Option<usize>,
    /// Claimed mutants.
    pub killed: BTreeSet<MutationId>,
    /// Kill counts per kill type.
    pub kills_by_type: BTreeMap<String, usize>,
    /// Kill claims whose record is not written yet (or was lost in a crash).
    pub kills_without_record: BTreeSet<MutationId>,
    /// Tests with a summary.
    pub tests_summarized: Vec<String>,
    /// Summarized tests that stopped before trying every candidate.
    pub tests_terminated_early: Vec<String>,
    /// Abandoned tests with their reasons.
    pub tests_abandoned: BTreeMap<String, String>,
    /// Claimed tests that are neither summarized nor abandoned.
    pub tests_incomplete: Vec<String>,
    /// Tests whose coverage-tracking run produced a tracking file.
    pub tests_tracked: usize,
    /// Tests whose coverage-tracking run produced nothing.
    pub tests_without_tracking: usize,
    /// Mutants some summarized test covered that nobody has killed.
    pub covered_not_killed: BTreeSet<MutationId>,
    /// `killed / num_mutations` as a percentage.
    pub kill_ratio: Option<f64>,
}

impl CampaignReport {
    /// Read the whole store behind `ledger`.
    pub fn collect<S: ClaimStore>(
        ledger: &Ledger<S>,
        num_mutations: Option<usize>,
    ) -> Result<Self, LedgerError> {
        let killed = ledger.killed_mutants()?;
        let mut kills_by_type = BTreeMap::new();
        let mut kills_without_record = BTreeSet::new();
        for &id in &killed {
            match ledger.kill_record(id)? {
                Some(record) => *kills_by_type.entry(record.kill_type).or_insert(0) += 1,
                None => {
                    kills_without_record.insert(id);
                }
            }
        }

        let mut tests_summarized = Vec::new();
        let mut tests_terminated_early = Vec::new();
        let mut tests_abandoned = BTreeMap::new();
        let mut tests_incomplete = Vec::new();
        let mut covered = BTreeSet::new();
        for test in ledger.tests()? {
            if let Some(summary) = ledger.test_summary(&test)? {
                covered.extend(summary.covered_mutants.iter().copied());
                if summary.terminated_early {
                    tests_terminated_early.push(test.clone());
                }
                tests_summarized.push(test);
            } else if let Some(reason) = ledger.abandon_reason(&test)? {
                tests_abandoned.insert(test, reason);
            } else {
                tests_incomplete.push(test);
            }
        }

        let mut tests_tracked = 0;
        let mut tests_without_tracking = 0;
        for test in ledger.tracked_tests()? {
            match ledger.tracking(&test)? {
                Some(TrackingRecord::Covered(_)) => tests_tracked += 1,
                Some(TrackingRecord::NoTracking) => tests_without_tracking += 1,
                None => {}
            }
        }

        let covered_not_killed = covered.difference(&killed).copied().collect();
        let kill_ratio = num_mutations
            .filter(|total| *total > 0)
            .map(|total| (killed.len() as f64) * 100.0 / (total as f64));

        Ok(Self {
            num_mutations,
            killed,
            kills_by_type,
            kills_without_record,
            tests_summarized,
            tests_terminated_early,
            tests_abandoned,
            tests_incomplete,
            tests_tracked,
            tests_without_tracking,
            covered_not_killed,
            kill_ratio,
        })
    }

    /// Render in the requested format.
    pub fn render(&self, format: ReportFormat) -> Result<String, serde_json::Error> {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(self),
            ReportFormat::Markdown => Ok(self.render_markdown()),
        }
    }

    fn render_markdown(&self) -> String {
        let mut out = String::from("# Mutant Campaign\n\n");

        out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
        if let Some(total) = self.num_mutations {
            let _ = writeln!(out, "| mutations | {total} |");
        }
        let _ = writeln!(out, "| killed | {} |", self.killed.len());
        let _ = writeln!(out, "| covered, not killed | {} |", self.covered_not_killed.len());
        let _ = writeln!(out, "| tests summarized | {} |", self.tests_summarized.len());
        let _ = writeln!(out, "| tests terminated early | {} |", self.tests_terminated_early.len());
        let _ = writeln!(out, "| tests abandoned | {} |", self.tests_abandoned.len());
        let _ = writeln!(out, "| tests incomplete | {} |", self.tests_incomplete.len());
        let _ = writeln!(out, "| tests with tracking | {} |", self.tests_tracked);
        let _ = writeln!(out, "| tests without tracking | {} |", self.tests_without_tracking);
        if let Some(ratio) = self.kill_ratio {
            let _ = writeln!(out, "| kill ratio | {ratio:.2}% |");
        }

        if !self.kills_by_type.is_empty() {
            out.push_str("\n## Kills by type\n\n| kill type | count |\n|---|---:|\n");
            for (kill_type, count) in &self.kills_by_type {
                let _ = writeln!(out, "| {kill_type} | {count} |");
            }
        }

        if !self.kills_without_record.is_empty() {
            let _ = writeln!(
                out,
                "\n## Claims without kill record\n\n{}",
                join_ids(&self.kills_without_record)
            );
        }

        if !self.tests_incomplete.is_empty() {
            out.push_str("\n## Incomplete tests\n\n");
            for test in &self.tests_incomplete {
                let _ = writeln!(out, "- {test}");
            }
        }

        if !self.tests_abandoned.is_empty() {
            out.push_str("\n## Abandoned tests\n\n");
            for (test, reason) in &self.tests_abandoned {
                let _ = writeln!(out, "- {test}: {reason}");
            }
        }

        if !self.covered_not_killed.is_empty() {
            let _ = writeln!(
                out,
                "\n## Covered but not killed\n\n{}",
                join_ids(&self.covered_not_killed)
            );
        }

        out
    }
}

fn join_ids(ids: &BTreeSet<MutationId>) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::ledger::{KillRecord, MemoryStore, TestSummary};
    use crate::campaign::oracle::KillEvidence;

    fn kill(ledger: &Ledger<MemoryStore>, id: MutationId, test: &str, kill_type: &str) {
        ledger.claim_mutant(id).expect("claim should work");
        ledger
            .record_kill(
                id,
                &KillRecord {
                    killing_test: test.to_string(),
                    kill_type: kill_type.to_string(),
                    evidence: KillEvidence::Suite {
                        killing_tests: vec!["a".to_string()],
                    },
                },
            )
            .expect("record should write");
    }

    fn sample_ledger() -> Ledger<MemoryStore> {
        let ledger = Ledger::with_store(MemoryStore::new());
        kill(&ledger, 1, "t1", "KILL_TEST_FAIL");
        kill(&ledger, 2, "t1", "KILL_TEST_FAIL");
        ledger.claim_mutant(7).expect("claim should work");

        for test in ["t1", "t2", "t3", "t4"] {
            ledger.claim_test(test).expect("claim should work");
        }
        ledger.record_tracking("t1", b"1\n2\n3\n").expect("tracking should write");
        ledger
            .write_summary(&TestSummary {
                test: "t1".to_string(),
                terminated_early: true,
                covered_mutants: vec![1, 2, 3, 4],
                killed_mutants: vec![1, 2],
                skipped_mutants: vec![],
                survived_mutants: vec![3],
            })
            .expect("summary should write");
        ledger.record_no_tracking("t2").expect("marker should write");
        ledger
            .record_abandoned("t2", "no mutant tracking file created")
            .expect("marker should write");
        ledger
            .record_abandoned("t3", "runtime timeout")
            .expect("marker should write");
        ledger
    }

    #[test]
    fn report_classifies_tests_and_kills() {
        let report = CampaignReport::collect(&sample_ledger(), Some(10)).expect("report should build");
        assert_eq!(report.killed, BTreeSet::from([1, 2, 7]));
        assert_eq!(
            report.kills_by_type,
            BTreeMap::from([("KILL_TEST_FAIL".to_string(), 2)])
        );
        assert_eq!(report.kills_without_record, BTreeSet::from([7]));
        assert_eq!(report.tests_summarized, vec!["t1".to_string()]);
        assert_eq!(report.tests_terminated_early, vec!["t1".to_string()]);
        assert_eq!(report.tests_abandoned.len(), 2);
        assert_eq!(report.tests_incomplete, vec!["t4".to_string()]);
        assert_eq!(report.tests_tracked, 1);
        assert_eq!(report.tests_without_tracking, 1);
        assert_eq!(report.covered_not_killed, BTreeSet::from([3, 4]));
        assert_eq!(report.kill_ratio, Some(30.0));
    }

    #[test]
    fn empty_store_reports_nothing() {
        let ledger = Ledger::with_store(MemoryStore::new());
        let report = CampaignReport::collect(&ledger, Some(0)).expect("report should build");
        assert!(report.killed.is_empty());
        assert_eq!(report.kill_ratio, None);
        let markdown = report.render(ReportFormat::Markdown).expect("markdown renders");
        assert!(markdown.contains("| killed | 0 |"));
        assert!(!markdown.contains("Kills by type"));
    }

    #[test]
    fn renders_markdown_and_json() {
        let report = CampaignReport::collect(&sample_ledger(), None).expect("report should build");
        let markdown = report.render(ReportFormat::Markdown).expect("markdown renders");
        assert!(markdown.contains("| KILL_TEST_FAIL | 2 |"));
        assert!(markdown.contains("- t3: runtime timeout"));
        assert!(markdown.contains("## Covered but not killed\n\n3, 4"));
        assert!(!markdown.contains("kill ratio"));

        let json: serde_json::Value =
            serde_json::from_str(&report.render(ReportFormat::Json).expect("json renders"))
                .expect("report JSON should parse");
        assert_eq!(json["killed"], serde_json::json!([1, 2, 7]));
        assert_eq!(json["tests_incomplete"], serde_json::json!(["t4"]));
        assert!(json["kill_ratio"].is_null());
    }
}
