//! # Docmover Core
//!
//! Runtime-free building blocks for docmover: the items and batches that
//! flow through the batching engine, the partition model, and the store
//! contracts the engine drives (bulk write, paginated key query, topology
//! discovery).
//!
//! This crate contains no tokio or HTTP dependencies. Store backends live
//! behind the traits in [`store`]; an in-memory partitioned cluster is
//! provided in [`store::memory`] for tests and local runs.

pub mod models;
pub mod store;
