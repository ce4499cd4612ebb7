//! Durable, first-writer-wins record of killed mutants and processed tests.
//!
//! The only cross-process primitive is [`ClaimStore::claim`]: an atomic
//! create-if-absent on a key. [`DirStore`] maps it onto `create_dir`, which
//! every POSIX filesystem performs atomically; [`MemoryStore`] backs tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::oracle::KillEvidence;
use super::tree::MutationId;

/// Evidence file stored with each killed mutant.
pub const KILL_INFO_FILE: &str = "kill_info.json";
/// Summary file stored with each processed test.
pub const KILL_SUMMARY_FILE: &str = "kill_summary.json";
/// Raw tracking output kept per test.
pub const COVERED_MUTANTS_FILE: &str = "covered_mutants.txt";
/// Marker written when a test produced no tracking output.
pub const NO_TRACKING_FILE: &str = "no_tracking.txt";
/// Reason a claimed test was abandoned before summarizing.
pub const ABANDONED_FILE: &str = "abandoned.txt";

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage I/O failure.
    #[error("ledger io error at {path}: {source}")]
    Io {
        /// Location involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Record could not be (de)serialized.
    #[error("ledger record {key}/{file} is invalid: {source}")]
    Record {
        /// Record key.
        key: String,
        /// File within the record.
        file: String,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Key is not a single path component.
    #[error("invalid ledger key {0:?}")]
    InvalidKey(String),
    /// In-memory store lock was poisoned.
    #[error("ledger store lock poisoned")]
    Poisoned,
}

/// Partition of the store's key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// One key per claimed mutation id.
    KilledMutants,
    /// One key per claimed test.
    Tests,
    /// Raw coverage evidence per test.
    Tracking,
}

impl Namespace {
    /// Directory name under the store root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::KilledMutants => "killed_mutants",
            Self::Tests => "tests",
            Self::Tracking => "tracking",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Result of an atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller created the key.
    Claimed,
    /// Someone created the key first.
    AlreadyClaimed,
}

/// Key/value store offering atomic create-if-absent.
///
/// Each key holds a small set of named files. `claim` must succeed for
/// exactly one caller per key across every process sharing the store.
pub trait ClaimStore: Send + Sync {
    /// Atomically create `key` if absent.
    fn claim(&self, ns: Namespace, key: &str) -> Result<ClaimOutcome, LedgerError>;

    /// True if `key` exists.
    fn is_claimed(&self, ns: Namespace, key: &str) -> Result<bool, LedgerError>;

    /// Replace `file` under `key`, creating the key if needed. Readers see
    /// either the old or the new content.
    fn put(&self, ns: Namespace, key: &str, file: &str, bytes: &[u8]) -> Result<(), LedgerError>;

    /// Content of `file` under `key`, if present.
    fn get(&self, ns: Namespace, key: &str, file: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Every key in `ns`, sorted.
    fn keys(&self, ns: Namespace) -> Result<Vec<String>, LedgerError>;
}

fn check_key(key: &str) -> Result<(), LedgerError> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(LedgerError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Store rooted at a directory, one subdirectory per key.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Store under `root`; directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, ns: Namespace, key: &str) -> Result<PathBuf, LedgerError> {
        check_key(key)?;
        Ok(self.root.join(ns.dir_name()).join(key))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ClaimStore for DirStore {
    fn claim(&self, ns: Namespace, key: &str) -> Result<ClaimOutcome, LedgerError> {
        let dir = self.key_dir(ns, key)?;
        let parent = self.root.join(ns.dir_name());
        std::fs::create_dir_all(&parent).map_err(io_err(&parent))?;
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            Err(source) => Err(LedgerError::Io { path: dir, source }),
        }
    }

    fn is_claimed(&self, ns: Namespace, key: &str) -> Result<bool, LedgerError> {
        Ok(self.key_dir(ns, key)?.is_dir())
    }

    fn put(&self, ns: Namespace, key: &str, file: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        check_key(file)?;
        let dir = self.key_dir(ns, key)?;
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let target = dir.join(file);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
        tmp.flush().map_err(io_err(&target))?;
        tmp.as_file().sync_all().map_err(io_err(&target))?;
        tmp.persist(&target)
            .map_err(|err| LedgerError::Io {
                path: target.clone(),
                source: err.error,
            })?;
        Ok(())
    }

    fn get(&self, ns: Namespace, key: &str, file: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        check_key(file)?;
        let path = self.key_dir(ns, key)?.join(file);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LedgerError::Io { path, source }),
        }
    }

    fn keys(&self, ns: Namespace) -> Result<Vec<String>, LedgerError> {
        let dir = self.root.join(ns.dir_name());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Io { path: dir, source }),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            if !entry.file_type().map_err(io_err(&dir))?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

type MemoryKeys = BTreeMap<(Namespace, String), BTreeMap<String, Vec<u8>>>;

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<MemoryKeys>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut MemoryKeys) -> T) -> Result<T, LedgerError> {
        let mut entries = self.entries.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(f(&mut *entries))
    }
}

impl ClaimStore for MemoryStore {
    fn claim(&self, ns: Namespace, key: &str) -> Result<ClaimOutcome, LedgerError> {
        check_key(key)?;
        self.with_entries(|entries| match entries.entry((ns, key.to_string())) {
            std::collections::btree_map::Entry::Occupied(_) => ClaimOutcome::AlreadyClaimed,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(BTreeMap::new());
                ClaimOutcome::Claimed
            }
        })
    }

    fn is_claimed(&self, ns: Namespace, key: &str) -> Result<bool, LedgerError> {
        check_key(key)?;
        self.with_entries(|entries| entries.contains_key(&(ns, key.to_string())))
    }

    fn put(&self, ns: Namespace, key: &str, file: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        check_key(key)?;
        check_key(file)?;
        self.with_entries(|entries| {
            entries
                .entry((ns, key.to_string()))
                .or_default()
                .insert(file.to_string(), bytes.to_vec());
        })
    }

    fn get(&self, ns: Namespace, key: &str, file: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        check_key(key)?;
        self.with_entries(|entries| {
            entries
                .get(&(ns, key.to_string()))
                .and_then(|files| files.get(file).cloned())
        })
    }

    fn keys(&self, ns: Namespace) -> Result<Vec<String>, LedgerError> {
        self.with_entries(|entries| {
            entries
                .keys()
                .filter(|(key_ns, _)| *key_ns == ns)
                .map(|(_, key)| key.clone())
                .collect()
        })
    }
}

/// Evidence persisted for a killed mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRecord {
    /// Test that killed the mutant.
    pub killing_test: String,
    /// Kill status name, e.g. `KILL_DIFFERENT_STDOUT`.
    pub kill_type: String,
    /// Oracle-specific evidence.
    #[serde(flatten)]
    pub evidence: KillEvidence,
}

/// Per-test partition of the covered mutants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Test name.
    pub test: String,
    /// The loop stopped before every covered mutant was considered.
    pub terminated_early: bool,
    /// Covered mutants eligible for this campaign, sorted.
    pub covered_mutants: Vec<MutationId>,
    /// Killed by this test, sorted.
    pub killed_mutants: Vec<MutationId>,
    /// Already killed elsewhere, sorted.
    pub skipped_mutants: Vec<MutationId>,
    /// Tried and survived under this test, sorted.
    pub survived_mutants: Vec<MutationId>,
}

impl TestSummary {
    /// True if killed, skipped and survived are disjoint and cover exactly
    /// the covered set.
    pub fn is_complete_partition(&self) -> bool {
        let covered: BTreeSet<_> = self.covered_mutants.iter().copied().collect();
        let mut seen = BTreeSet::new();
        for id in self
            .killed_mutants
            .iter()
            .chain(&self.skipped_mutants)
            .chain(&self.survived_mutants)
        {
            if !seen.insert(*id) {
                return false;
            }
        }
        seen == covered
    }
}

/// Coverage evidence kept for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingRecord {
    /// Raw tracking output.
    Covered(Vec<u8>),
    /// The tracking build wrote nothing.
    NoTracking,
}

/// Typed view of a [`ClaimStore`] laid out as a kill-tracking root.
#[derive(Debug)]
pub struct Ledger<S = DirStore> {
    store: S,
}

impl Ledger<DirStore> {
    /// Ledger over the kill-tracking directory `root`.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::with_store(DirStore::new(root))
    }
}

impl<S: ClaimStore> Ledger<S> {
    /// Ledger over an arbitrary store.
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn put_json<T: Serialize>(
        &self,
        ns: Namespace,
        key: &str,
        file: &str,
        value: &T,
    ) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| LedgerError::Record {
            key: key.to_string(),
            file: file.to_string(),
            source,
        })?;
        self.store.put(ns, key, file, &json)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        ns: Namespace,
        key: &str,
        file: &str,
    ) -> Result<Option<T>, LedgerError> {
        let Some(bytes) = self.store.get(ns, key, file)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| LedgerError::Record {
                key: key.to_string(),
                file: file.to_string(),
                source,
            })
    }

    /// Claim a mutant as killed. Only the caller seeing
    /// [`ClaimOutcome::Claimed`] may record evidence.
    pub fn claim_mutant(&self, id: MutationId) -> Result<ClaimOutcome, LedgerError> {
        self.store.claim(Namespace::KilledMutants, &id.to_string())
    }

    /// True if any worker has claimed `id`.
    pub fn is_killed(&self, id: MutationId) -> Result<bool, LedgerError> {
        self.store.is_claimed(Namespace::KilledMutants, &id.to_string())
    }

    /// Store kill evidence; rewriting the same record is harmless.
    pub fn record_kill(&self, id: MutationId, record: &KillRecord) -> Result<(), LedgerError> {
        self.put_json(
            Namespace::KilledMutants,
            &id.to_string(),
            KILL_INFO_FILE,
            record,
        )
    }

    /// Kill evidence for `id`, if written.
    pub fn kill_record(&self, id: MutationId) -> Result<Option<KillRecord>, LedgerError> {
        self.get_json(Namespace::KilledMutants, &id.to_string(), KILL_INFO_FILE)
    }

    /// Every claimed mutant id. Keys that are not ids are ignored.
    pub fn killed_mutants(&self) -> Result<BTreeSet<MutationId>, LedgerError> {
        Ok(self
            .store
            .keys(Namespace::KilledMutants)?
            .into_iter()
            .filter_map(|key| key.parse().ok())
            .collect())
    }

    /// Claim a test so no other worker processes it.
    pub fn claim_test(&self, test: &str) -> Result<ClaimOutcome, LedgerError> {
        self.store.claim(Namespace::Tests, test)
    }

    /// Store a file next to the test's summary.
    pub fn put_test_artifact(&self, test: &str, file: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        self.store.put(Namespace::Tests, test, file, bytes)
    }

    /// Persist the test's kill summary.
    pub fn write_summary(&self, summary: &TestSummary) -> Result<(), LedgerError> {
        self.put_json(Namespace::Tests, &summary.test, KILL_SUMMARY_FILE, summary)
    }

    /// Kill summary for `test`; `None` if the test was claimed but never
    /// summarized.
    pub fn test_summary(&self, test: &str) -> Result<Option<TestSummary>, LedgerError> {
        self.get_json(Namespace::Tests, test, KILL_SUMMARY_FILE)
    }

    /// Note why a claimed test produced no summary.
    pub fn record_abandoned(&self, test: &str, reason: &str) -> Result<(), LedgerError> {
        self.store
            .put(Namespace::Tests, test, ABANDONED_FILE, reason.as_bytes())
    }

    /// Reason a claimed test was abandoned, if it was.
    pub fn abandon_reason(&self, test: &str) -> Result<Option<String>, LedgerError> {
        Ok(self
            .store
            .get(Namespace::Tests, test, ABANDONED_FILE)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Every claimed test.
    pub fn tests(&self) -> Result<Vec<String>, LedgerError> {
        self.store.keys(Namespace::Tests)
    }

    /// Keep the raw tracking output for `test`.
    pub fn record_tracking(&self, test: &str, raw: &[u8]) -> Result<(), LedgerError> {
        self.store
            .put(Namespace::Tracking, test, COVERED_MUTANTS_FILE, raw)
    }

    /// Mark that `test` produced no tracking output.
    pub fn record_no_tracking(&self, test: &str) -> Result<(), LedgerError> {
        self.store.put(Namespace::Tracking, test, NO_TRACKING_FILE, b"")
    }

    /// Coverage evidence for `test`.
    pub fn tracking(&self, test: &str) -> Result<Option<TrackingRecord>, LedgerError> {
        if let Some(raw) = self.store.get(Namespace::Tracking, test, COVERED_MUTANTS_FILE)? {
            return Ok(Some(TrackingRecord::Covered(raw)));
        }
        if self.store.get(Namespace::Tracking, test, NO_TRACKING_FILE)?.is_some() {
            return Ok(Some(TrackingRecord::NoTracking));
        }
        Ok(None)
    }

    /// Every test with coverage evidence.
    pub fn tracked_tests(&self) -> Result<Vec<String>, LedgerError> {
        self.store.keys(Namespace::Tracking)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tempfile::tempdir;

    use super::*;

    fn race_claims<S: ClaimStore + 'static>(store: Arc<S>) -> usize {
        const RACERS: usize = 16;
        let barrier = Arc::new(Barrier::new(RACERS));
        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .claim(Namespace::KilledMutants, "42")
                        .expect("claim should not error")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("racer should not panic"))
            .filter(|outcome| *outcome == ClaimOutcome::Claimed)
            .count()
    }

    #[test]
    fn concurrent_directory_claims_have_one_winner() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = Arc::new(DirStore::new(tmp.path()));
        assert_eq!(race_claims(Arc::clone(&store)), 1);
        assert!(tmp.path().join("killed_mutants").join("42").is_dir());
    }

    #[test]
    fn concurrent_memory_claims_have_one_winner() {
        assert_eq!(race_claims(Arc::new(MemoryStore::new())), 1);
    }

    #[test]
    fn kill_record_layout_is_flat() {
        let tmp = tempdir().expect("tempdir should be created");
        let ledger = Ledger::open(tmp.path());
        assert_eq!(
            ledger.claim_mutant(7).expect("claim should work"),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            ledger.claim_mutant(7).expect("second claim should work"),
            ClaimOutcome::AlreadyClaimed
        );
        let record = KillRecord {
            killing_test: "fuzz_17".to_string(),
            kill_type: "KILL_DIFFERENT_STDOUT".to_string(),
            evidence: KillEvidence::Program {
                unmutated_stdout: "outputs = [1]".to_string(),
                mutated_stdout: "outputs = [2]".to_string(),
            },
        };
        ledger.record_kill(7, &record).expect("record should write");
        ledger.record_kill(7, &record).expect("rewrite should be harmless");

        let raw = std::fs::read_to_string(tmp.path().join("killed_mutants/7/kill_info.json"))
            .expect("kill info should exist");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("kill info is json");
        assert_eq!(value["killing_test"], "fuzz_17");
        assert_eq!(value["oracle"], "program");
        assert_eq!(value["mutated_stdout"], "outputs = [2]");

        assert_eq!(
            ledger.kill_record(7).expect("record should read"),
            Some(record)
        );
        assert_eq!(ledger.kill_record(8).expect("missing record reads"), None);
        assert_eq!(
            ledger.killed_mutants().expect("listing should work"),
            BTreeSet::from([7])
        );
    }

    #[test]
    fn directory_writes_replace_whole_file() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = DirStore::new(tmp.path());
        store
            .put(Namespace::Tests, "t1", "kill_summary.json", b"first version")
            .expect("first write should work");
        store
            .put(Namespace::Tests, "t1", "kill_summary.json", b"second")
            .expect("rewrite should work");

        assert_eq!(
            store
                .get(Namespace::Tests, "t1", "kill_summary.json")
                .expect("read should work"),
            Some(b"second".to_vec())
        );
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("tests/t1"))
            .expect("test dir should exist")
            .map(|entry| entry.expect("entry should be readable").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("kill_summary.json")]);
    }

    #[test]
    fn claimed_test_without_summary_is_incomplete() {
        let ledger = Ledger::with_store(MemoryStore::new());
        assert_eq!(
            ledger.claim_test("q1").expect("claim should work"),
            ClaimOutcome::Claimed
        );
        assert_eq!(ledger.test_summary("q1").expect("read should work"), None);

        let summary = TestSummary {
            test: "q1".to_string(),
            terminated_early: false,
            covered_mutants: vec![1, 2, 3],
            killed_mutants: vec![2],
            skipped_mutants: vec![1],
            survived_mutants: vec![3],
        };
        assert!(summary.is_complete_partition());
        ledger.write_summary(&summary).expect("summary should write");
        assert_eq!(
            ledger.test_summary("q1").expect("read should work"),
            Some(summary)
        );
        assert_eq!(ledger.tests().expect("listing"), vec!["q1".to_string()]);
    }

    #[test]
    fn tracking_records_distinguish_missing_output() {
        let tmp = tempdir().expect("tempdir should be created");
        let ledger = Ledger::open(tmp.path());
        ledger.record_tracking("a", b"1\n2\n").expect("tracking should write");
        ledger.record_no_tracking("b").expect("marker should write");
        assert_eq!(
            ledger.tracking("a").expect("read"),
            Some(TrackingRecord::Covered(b"1\n2\n".to_vec()))
        );
        assert_eq!(
            ledger.tracking("b").expect("read"),
            Some(TrackingRecord::NoTracking)
        );
        assert_eq!(ledger.tracking("c").expect("read"), None);
        assert_eq!(
            ledger.tracked_tests().expect("listing"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn keys_must_be_single_components() {
        let store = MemoryStore::new();
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(
                store.claim(Namespace::Tests, bad),
                Err(LedgerError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn partition_check_rejects_overlap_and_gaps() {
        let overlapping = TestSummary {
            covered_mutants: vec![1, 2],
            killed_mutants: vec![1],
            survived_mutants: vec![1, 2],
            ..TestSummary::default()
        };
        assert!(!overlapping.is_complete_partition());
        let gap = TestSummary {
            covered_mutants: vec![1, 2],
            killed_mutants: vec![1],
            ..TestSummary::default()
        };
        assert!(!gap.is_complete_partition());
    }
}
