//! Document ingestion.
//!
//! [`pipeline::IngestionPipeline`] drives parse → chunk → embed → store →
//! persist → (extract → graph) for one uploaded file, reporting progress
//! through the bus and catching every failure at its own boundary.

pub mod pipeline;

pub use pipeline::{IngestJob, IngestionPipeline};
