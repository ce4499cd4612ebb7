#![cfg(all(feature = "cli", unix))]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::tempdir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let script = dir.join(name);
    fs::write(&script, body).expect("fake script should be written");
    fs::set_permissions(&script, PermissionsExt::from_mode(0o755))
        .expect("fake script should be executable");
    script
}

fn description(ids: &[u32]) -> String {
    let groups: Vec<String> = ids
        .iter()
        .map(|id| format!(r#"{{"removeStmt": {{"mutationId": {id}}}}}"#))
        .collect();
    format!(
        r#"{{"infoForFiles": [{{"filename": "a.cc", "mutationTreeRoot": {{"children": [{{"children": [], "mutationGroups": [{}]}}], "mutationGroups": []}}}}]}}"#,
        groups.join(",")
    )
}

/// Mutation and tracking descriptions over ids `0..n`.
fn write_descriptions(dir: &Path, n: u32) -> (PathBuf, PathBuf) {
    let ids: Vec<u32> = (0..n).collect();
    let mutation = dir.join("mutation-info.json");
    let tracking = dir.join("tracking-info.json");
    fs::write(&mutation, description(&ids)).expect("description should be written");
    fs::write(&tracking, description(&ids)).expect("description should be written");
    (mutation, tracking)
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mutant-campaign"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("cli command should run")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp paths should be valid utf-8")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn read_json(path: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("{} should be readable: {err}", path.display()));
    serde_json::from_str(&raw).expect("stored file should be JSON")
}

fn killed_ids(kill_root: &Path) -> Vec<String> {
    let mut ids: Vec<String> = fs::read_dir(kill_root.join("killed_mutants"))
        .expect("killed_mutants should exist")
        .map(|entry| {
            entry
                .expect("entry should be readable")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    ids.sort();
    ids
}

const SUITE_RUNNER: &str = r#"#!/bin/sh
if [ -n "$DREDD_MUTANT_TRACKING_FILE" ]; then printf '1\n2\n' > "$DREDD_MUTANT_TRACKING_FILE"; fi
if [ "$DREDD_ENABLED_MUTATION" = 1 ]; then echo "t1 - fail"; else echo "t1 - pass"; fi
echo "t2 - pass"
"#;

#[test]
fn e2e_suite_reliable_campaign_resume_report() {
    let tmp = tempdir().expect("tempdir should be created");
    let (mutation, tracking) = write_descriptions(tmp.path(), 4);
    let runner = write_script(tmp.path(), "run-suite.sh", SUITE_RUNNER);
    let reliable = tmp.path().join("reliable_tests.json");
    let kill_root = tmp.path().join("kills");

    let output = run_cli(&[
        "reliable",
        "--runner",
        path_str(&runner),
        "--query",
        "webgpu:q:*",
        "--runs",
        "2",
        "--output",
        path_str(&reliable),
    ]);
    assert_success(&output);
    assert_eq!(read_json(&reliable), serde_json::json!(["t1", "t2"]));

    let campaign = [
        "suite",
        path_str(&mutation),
        path_str(&tracking),
        "--kill-root",
        path_str(&kill_root),
        "--runner",
        path_str(&runner),
        "--tracking-runner",
        path_str(&runner),
        "--query",
        "webgpu:q:*",
        "--reliable-tests",
        path_str(&reliable),
        "--total-test-time",
        "0",
        "--maximum-time-since-last-kill",
        "0",
    ];
    let output = run_cli(&campaign);
    assert_success(&output);
    assert!(stdout(&output).contains("kills=1, tests=1"), "{}", stdout(&output));

    assert_eq!(killed_ids(&kill_root), vec!["1".to_string()]);
    let kill_info = read_json(&kill_root.join("killed_mutants/1/kill_info.json"));
    assert_eq!(kill_info["killing_test"], "webgpu-q-");
    assert_eq!(kill_info["kill_type"], "KILL_TEST_FAIL");
    assert_eq!(kill_info["killing_tests"], serde_json::json!(["t1"]));

    let summary = read_json(&kill_root.join("tests/webgpu-q-/kill_summary.json"));
    assert_eq!(summary["covered_mutants"], serde_json::json!([1, 2]));
    assert_eq!(summary["killed_mutants"], serde_json::json!([1]));
    assert_eq!(summary["survived_mutants"], serde_json::json!([2]));
    assert_eq!(summary["terminated_early"], false);
    assert_eq!(
        fs::read_to_string(kill_root.join("tracking/webgpu-q-/covered_mutants.txt"))
            .expect("tracking file should be kept"),
        "1\n2\n"
    );

    // a second campaign finds the query already claimed
    let output = run_cli(&campaign);
    assert_success(&output);
    assert!(stdout(&output).contains("kills=0, tests=0, abandoned=0, skipped=1"));

    let output = run_cli(&[
        "report",
        "--kill-root",
        path_str(&kill_root),
        "--mutation-info",
        path_str(&mutation),
        "--format",
        "json",
    ]);
    assert_success(&output);
    let report: serde_json::Value =
        serde_json::from_str(&stdout(&output)).expect("report should be JSON");
    assert_eq!(report["killed"], serde_json::json!([1]));
    assert_eq!(report["kills_by_type"]["KILL_TEST_FAIL"], 1);
    assert_eq!(report["covered_not_killed"], serde_json::json!([2]));
    assert_eq!(report["kill_ratio"], 25.0);

    let output = run_cli(&["status", "--kill-root", path_str(&kill_root)]);
    assert_success(&output);
    let status = stdout(&output);
    assert_eq!(status.matches("journal: ").count(), 2);
    assert!(status.contains("kills=1"));
    assert!(status.contains("stopped: Exhausted"));
}

#[test]
fn e2e_suite_coverage_survey_kills_nothing() {
    let tmp = tempdir().expect("tempdir should be created");
    let (mutation, tracking) = write_descriptions(tmp.path(), 4);
    let runner = write_script(tmp.path(), "run-suite.sh", SUITE_RUNNER);
    let reliable = tmp.path().join("reliable_tests.json");
    fs::write(&reliable, r#"["t1"]"#).expect("reliable list should be written");
    let kill_root = tmp.path().join("kills");
    let survey = tmp.path().join("survey.json");

    let output = run_cli(&[
        "suite",
        path_str(&mutation),
        path_str(&tracking),
        "--kill-root",
        path_str(&kill_root),
        "--runner",
        path_str(&runner),
        "--tracking-runner",
        path_str(&runner),
        "--query",
        "webgpu:q:*",
        "--reliable-tests",
        path_str(&reliable),
        "--coverage-survey",
        "1",
        "--survey-output",
        path_str(&survey),
    ]);
    assert_success(&output);
    assert_eq!(read_json(&survey), serde_json::json!({ "webgpu-q-": [1, 2] }));
    assert!(!kill_root.join("killed_mutants").exists());
    assert!(!kill_root.join("tests").exists());
}

#[test]
fn e2e_fuzz_workers_share_one_kill_root() {
    let tmp = tempdir().expect("tempdir should be created");
    let (mutation, tracking) = write_descriptions(tmp.path(), 6);
    let fuzzer = write_script(
        tmp.path(),
        "fuzzer.sh",
        r#"#!/bin/sh
case "$1" in
  gen) printf '// [7]\nfn main() {}\n' > "$3" ;;
  recondition) cp "$2" "$3" ;;
  run) echo "outputs = [7]" ;;
esac
"#,
    );
    let tracking_runner = write_script(
        tmp.path(),
        "tracking.sh",
        "#!/bin/sh\nprintf '3\\n4\\n5\\n' > \"$DREDD_MUTANT_TRACKING_FILE\"\necho \"outputs = [7]\"\n",
    );
    let mutated_runner = write_script(
        tmp.path(),
        "mutated.sh",
        r#"#!/bin/sh
case "$DREDD_ENABLED_MUTATION" in
  3) echo "compiler crashed" >&2; exit 1 ;;
  4) echo "outputs = [8]" ;;
  *) echo "outputs = [7]" ;;
esac
"#,
    );
    let kill_root = tmp.path().join("kills");

    let output = run_cli(&[
        "fuzz",
        path_str(&mutation),
        path_str(&tracking),
        "--kill-root",
        path_str(&kill_root),
        "--fuzzer",
        path_str(&fuzzer),
        "--mutated-runner",
        path_str(&mutated_runner),
        "--tracking-runner",
        path_str(&tracking_runner),
        "--seed",
        "11",
        "--max-tests",
        "2",
        "--workers",
        "2",
        "--total-test-time",
        "0",
        "--maximum-time-since-last-kill",
        "0",
    ]);
    assert_success(&output);
    assert!(stdout(&output).contains("workers finished: 2"));

    assert_eq!(killed_ids(&kill_root), vec!["3".to_string(), "4".to_string()]);
    assert_eq!(
        read_json(&kill_root.join("killed_mutants/3/kill_info.json"))["kill_type"],
        "KILL_COMPILER_CRASH"
    );
    let stdout_kill = read_json(&kill_root.join("killed_mutants/4/kill_info.json"));
    assert_eq!(stdout_kill["kill_type"], "KILL_DIFFERENT_STDOUT");
    assert_eq!(stdout_kill["mutated_stdout"], "outputs = [8]\n");

    let tests: Vec<PathBuf> = fs::read_dir(kill_root.join("tests"))
        .expect("tests dir should exist")
        .map(|entry| entry.expect("entry should be readable").path())
        .collect();
    assert!(!tests.is_empty() && tests.len() <= 4);
    for test in &tests {
        let name = test
            .file_name()
            .expect("test dir has a name")
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("fuzz_"), "unexpected test dir {name}");
        assert!(test.join("prog.wgsl").exists());
        let summary = read_json(&test.join("kill_summary.json"));
        assert_eq!(summary["covered_mutants"], serde_json::json!([3, 4, 5]));
        assert_eq!(summary["terminated_early"], false);
    }

    let journals = fs::read_dir(kill_root.join("journal"))
        .expect("journal dir should exist")
        .count();
    assert_eq!(journals, 2);
}

#[test]
fn e2e_check_trees_rejects_divergent_descriptions() {
    let tmp = tempdir().expect("tempdir should be created");
    let mutation = tmp.path().join("mutation-info.json");
    let tracking = tmp.path().join("tracking-info.json");
    fs::write(&mutation, description(&[0, 1, 2])).expect("description should be written");
    fs::write(&tracking, description(&[0, 1])).expect("description should be written");

    let output = run_cli(&["check-trees", path_str(&mutation), path_str(&tracking)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("diverge"));

    let output = run_cli(&["check-trees", path_str(&mutation), path_str(&mutation)]);
    assert!(!output.status.success());

    fs::write(&tracking, description(&[0, 1, 2])).expect("description should be written");
    let output = run_cli(&["check-trees", path_str(&mutation), path_str(&tracking)]);
    assert_success(&output);
    assert!(stdout(&output).contains("mutations: 3"));
}
