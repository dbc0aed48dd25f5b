//! Idempotent loader.
//!
//! Two strategies, one contract: after a load the target holds the union of
//! what it held before and the new rows, with at most one row per key.
//! Existing rows always win over incoming rows with the same key, and within
//! a batch the first row seen for a key wins.

pub mod anti_join;
pub mod partition;

pub use anti_join::merge_anti_join;
pub use partition::overwrite_partitions;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::metrics::{self, MetricName};
use crate::schema::{Row, RowKey, TableSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    AntiJoin,
    OverwritePartition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub strategy: LoadStrategy,
    /// Rows handed to the loader.
    pub candidates: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    /// Batch rows dropped because an earlier batch row had the same key but
    /// different values.
    pub key_conflicts: usize,
    pub partitions_replaced: usize,
}

impl LoadReport {
    fn new(spec: &TableSpec, strategy: LoadStrategy, candidates: usize) -> Self {
        Self {
            table: spec.name().to_string(),
            strategy,
            candidates,
            inserted: 0,
            skipped_existing: 0,
            key_conflicts: 0,
            partitions_replaced: 0,
        }
    }

    fn record_metrics(&self) {
        let label = || ("table", self.table.clone());
        metrics::increment(MetricName::LoaderRowsInserted, label(), self.inserted as u64);
        metrics::increment(
            MetricName::LoaderRowsSkippedExisting,
            label(),
            self.skipped_existing as u64,
        );
        metrics::increment(MetricName::LoaderKeyConflicts, label(), self.key_conflicts as u64);
        metrics::increment(
            MetricName::LoaderPartitionsReplaced,
            label(),
            self.partitions_replaced as u64,
        );
    }
}

/// Keep the first row per key. Exact repeats vanish silently; rows that share
/// a key but differ elsewhere are counted as conflicts and logged.
pub fn dedupe_by_key(spec: &TableSpec, rows: Vec<Row>) -> (Vec<Row>, usize) {
    let mut kept: Vec<Row> = Vec::with_capacity(rows.len());
    let mut index: HashMap<RowKey, usize> = HashMap::new();
    let mut conflicts = 0;

    for row in rows {
        let key = spec.key_of(&row);
        match index.get(&key) {
            Some(&i) if kept[i] == row => {}
            Some(_) => {
                conflicts += 1;
                warn!(
                    table = %spec.id,
                    key = %key,
                    "Conflicting rows for one key, keeping the first"
                );
            }
            None => {
                index.insert(key, kept.len());
                kept.push(row);
            }
        }
    }
    (kept, conflicts)
}

/// Split `rows` into those whose key is not in `existing` and a count of the
/// rest.
fn without_existing(
    spec: &TableSpec,
    rows: Vec<Row>,
    existing: &HashSet<RowKey>,
) -> (Vec<Row>, usize) {
    let before = rows.len();
    let fresh: Vec<Row> = rows
        .into_iter()
        .filter(|row| !existing.contains(&spec.key_of(row)))
        .collect();
    let skipped = before - fresh.len();
    (fresh, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::schema::{Scalar, StarSchema};

    fn user(id: &str, level: &str) -> Row {
        Row::new(vec![
            Scalar::from(id),
            Scalar::from("Lily"),
            Scalar::from("Koch"),
            Scalar::from("F"),
            Scalar::from(level),
        ])
    }

    #[test]
    fn test_dedupe_by_key_first_wins() {
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let rows = vec![
            user("15", "free"),
            user("15", "free"),
            user("15", "paid"),
            user("16", "paid"),
        ];
        let (kept, conflicts) = dedupe_by_key(&star.users, rows);
        assert_eq!(kept, vec![user("15", "free"), user("16", "paid")]);
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn test_without_existing() {
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let existing: HashSet<RowKey> = [RowKey(vec!["15".to_string()])].into_iter().collect();
        let (fresh, skipped) =
            without_existing(&star.users, vec![user("15", "paid"), user("16", "free")], &existing);
        assert_eq!(fresh, vec![user("16", "free")]);
        assert_eq!(skipped, 1);
    }
}
