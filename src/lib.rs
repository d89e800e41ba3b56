// src/lib.rs

//! Lineage Provenance Index
//!
//! Index over a Merkle DAG of software-source artifacts answering, for any
//! content blob, where it first appeared (revision, date, path) and where
//! it appears at all.
//!
//! # Architecture
//!
//! - Database-first: the whole index lives in SQLite, in one of four
//!   storage flavors fixed at creation time
//! - Isochrone frontiers: directories whose content entirely predates a
//!   revision are linked once and flattened, bounding blob-to-revision
//!   storage
//! - Write-through cache: each ingestion worker buffers a batch and
//!   flushes it in a crash-safe order
//! - Origin layer: snapshots' head revisions and their histories are
//!   attached to the origins serving them, first writer wins

pub mod archive;
pub mod db;
pub mod directory;
pub mod dump;
mod error;
pub mod graph;
pub mod journal;
pub mod model;
pub mod origin;
pub mod provenance;
pub mod revision;

pub use error::{Error, Result};
