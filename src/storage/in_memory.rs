use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{CreateMode, PartitionSink, PartitionValues, Sink};
use crate::error::{EtlError, Result};
use crate::schema::{Row, RowKey, TableSpec};

/// In-memory sink for development/testing
#[derive(Clone, Default)]
pub struct InMemorySink {
    tables: Arc<Mutex<HashMap<String, Vec<Row>>>>,
    enforce_unique: bool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject appends whose key is already present, the way a store with a
    /// uniqueness constraint would.
    pub fn enforcing_unique_keys() -> Self {
        Self {
            enforce_unique: true,
            ..Self::default()
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.lock().unwrap();
        tables.get(table).cloned().unwrap_or_default()
    }
}

fn missing(spec: &TableSpec) -> EtlError {
    EtlError::sink(spec.name(), "table does not exist")
}

#[async_trait]
impl Sink for InMemorySink {
    async fn create_table(&self, spec: &TableSpec, mode: CreateMode) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        match mode {
            CreateMode::Replace => {
                tables.insert(spec.name().to_string(), Vec::new());
            }
            CreateMode::IfAbsent => {
                tables.entry(spec.name().to_string()).or_default();
            }
        }
        Ok(())
    }

    async fn append_rows(&self, spec: &TableSpec, rows: &[Row]) -> Result<usize> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(spec.name()).ok_or_else(|| missing(spec))?;

        if self.enforce_unique {
            let mut keys: HashSet<RowKey> = table.iter().map(|r| spec.key_of(r)).collect();
            for row in rows {
                let key = spec.key_of(row);
                if !keys.insert(key.clone()) {
                    return Err(EtlError::DuplicateKeyRace {
                        table: spec.name().to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }

        table.extend_from_slice(rows);
        debug!("Appended {} rows to in-memory table {}", rows.len(), spec.id);
        Ok(rows.len())
    }

    async fn existing_keys(&self, spec: &TableSpec) -> Result<HashSet<RowKey>> {
        let tables = self.tables.lock().unwrap();
        let table = tables.get(spec.name()).ok_or_else(|| missing(spec))?;
        Ok(table.iter().map(|r| spec.key_of(r)).collect())
    }
}

/// A row belongs to a partition when it agrees on every partition column.
fn in_partition(spec: &TableSpec, row: &Row, partition: &PartitionValues) -> bool {
    partition.iter().all(|(column, value)| {
        spec.schema
            .index_of(column)
            .and_then(|i| row.get(i))
            .map(|v| &v.key_repr() == value)
            .unwrap_or(false)
    })
}

#[async_trait]
impl PartitionSink for InMemorySink {
    async fn read_partition(
        &self,
        spec: &TableSpec,
        partition: &PartitionValues,
    ) -> Result<Vec<Row>> {
        let tables = self.tables.lock().unwrap();
        let table = tables.get(spec.name()).ok_or_else(|| missing(spec))?;
        Ok(table
            .iter()
            .filter(|r| in_partition(spec, r, partition))
            .cloned()
            .collect())
    }

    async fn replace_partition(
        &self,
        spec: &TableSpec,
        partition: &PartitionValues,
        rows: &[Row],
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(spec.name()).ok_or_else(|| missing(spec))?;
        table.retain(|r| !in_partition(spec, r, partition));
        table.extend_from_slice(rows);
        Ok(())
    }
}
