use tracing::{info, instrument};

use super::{dedupe_by_key, without_existing, LoadReport, LoadStrategy};
use crate::error::Result;
use crate::schema::{Row, TableSpec};
use crate::storage::Sink;

/// Anti-join merge into a relational sink.
///
/// 1. Snapshot the keys the table already holds.
/// 2. Drop every candidate whose key is in the snapshot.
/// 3. Append the remainder.
///
/// Nothing is locked between steps 1 and 3. A concurrent writer that inserts
/// one of the remaining keys in that window either causes a duplicate or, on
/// a sink that enforces key uniqueness, a `DuplicateKeyRace` error.
#[instrument(skip(sink, spec, rows), fields(table = %spec.id, rows = rows.len()))]
pub async fn merge_anti_join(
    sink: &dyn Sink,
    spec: &TableSpec,
    rows: Vec<Row>,
) -> Result<LoadReport> {
    let mut report = LoadReport::new(spec, LoadStrategy::AntiJoin, rows.len());
    let (rows, conflicts) = dedupe_by_key(spec, rows);
    report.key_conflicts = conflicts;

    let existing = sink.existing_keys(spec).await?;
    let (fresh, skipped) = without_existing(spec, rows, &existing);
    report.skipped_existing = skipped;

    report.inserted = sink.append_rows(spec, &fresh).await?;

    info!(
        "Merged {}: {} inserted, {} already present, {} key conflicts",
        spec.id, report.inserted, report.skipped_existing, report.key_conflicts
    );
    report.record_metrics();
    Ok(report)
}
