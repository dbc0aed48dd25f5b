//! Sink ports and their implementations.
//!
//! A [`Sink`] is anything that can hold star tables: create them, append rows,
//! and report which keys it already holds. A [`PartitionSink`] can also swap
//! out one partition of a table at a time.

pub mod in_memory;
pub mod lake;
pub mod sqlite;

pub use in_memory::InMemorySink;
pub use lake::LakeSink;
pub use sqlite::SqliteSink;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::schema::{Row, RowKey, TableSpec};

/// Partition identity as ordered `column=value` pairs. Empty for an
/// unpartitioned table, in which case the whole table is the one partition.
pub type PartitionValues = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Drop whatever is there and start empty.
    Replace,
    /// Leave an existing table untouched.
    IfAbsent,
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn create_table(&self, spec: &TableSpec, mode: CreateMode) -> Result<()>;

    /// Append rows as given. Returns how many were written.
    async fn append_rows(&self, spec: &TableSpec, rows: &[Row]) -> Result<usize>;

    async fn existing_keys(&self, spec: &TableSpec) -> Result<HashSet<RowKey>>;
}

#[async_trait]
pub trait PartitionSink: Sink {
    async fn read_partition(&self, spec: &TableSpec, partition: &PartitionValues)
        -> Result<Vec<Row>>;

    /// Replace one partition wholesale. Readers see either the old or the new
    /// contents, never a mix.
    async fn replace_partition(
        &self,
        spec: &TableSpec,
        partition: &PartitionValues,
        rows: &[Row],
    ) -> Result<()>;
}
