//! Cross-module scenario tests.
//!
//! Module-local `#[cfg(test)]` suites cover each component in isolation;
//! the suites here exercise whole flows — ingestion, retrieval, chat —
//! against tempdir-backed stores with deterministic stub providers.

pub mod common;

mod chat_tests;
mod ingestion_tests;
mod retrieval_tests;
