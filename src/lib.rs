//! # mutant-campaign
//!
//! `mutant-campaign` drives mutant-kill campaigns against a compiler built
//! with source-level mutations. Each mutation can be switched on at run time
//! by id, and a separate coverage-tracking build reports which ids a test
//! reaches. The crate is organized around:
//! - `campaign::tree`: the structural index over mutation ids
//! - `campaign::oracle`: differential-output and pass/fail-regression kill classification
//! - `campaign::ledger`: the shared, first-writer-wins record of kills and tests
//! - `campaign::scheduler`: the per-worker campaign loop and its stop policies
//! - `campaign::harness`: program-fuzzer and conformance-suite test sources
//!
//! Workers coordinate only through the kill root on disk, so any number of
//! them may run concurrently and a stopped campaign resumes by starting it
//! again.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod campaign;
