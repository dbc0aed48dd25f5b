//! Dimension builder: projects typed records into deduplicated dimension rows.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, instrument};

use crate::constants::NEXT_SONG_PAGE;
use crate::domain::{
    start_time_from_millis, Artist, EventRecord, FieldMap, Record, Song, SongRecord, SourceRecord,
    TableRow, TimePart, User,
};
use crate::error::{EtlError, Result};
use crate::metrics::{self, MetricName};
use crate::schema::{Row, Scalar, TableSpec};

/// Ordered list of `source field -> target column` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<(String, String)>,
}

impl Projection {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            columns: pairs
                .iter()
                .map(|(source, target)| (source.to_string(), target.to_string()))
                .collect(),
        }
    }

    /// Same name on both sides.
    pub fn identity(names: &[&str]) -> Self {
        Self {
            columns: names.iter().map(|n| (n.to_string(), n.to_string())).collect(),
        }
    }

    pub fn apply<R: Record>(&self, record: &R) -> Result<FieldMap> {
        self.columns
            .iter()
            .map(|(source, target)| {
                record
                    .field(source)
                    .map(|value| (target.clone(), value))
                    .ok_or_else(|| {
                        EtlError::Config(format!("projection reads unknown field '{}'", source))
                    })
            })
            .collect()
    }
}

/// A dimension row type and how to get it from one kind of source record.
pub trait Dimension: TableRow + Sized {
    type Source: SourceRecord;

    fn default_projection() -> Projection;

    /// Records the dimension ignores entirely.
    fn admits(_record: &Self::Source) -> bool {
        true
    }

    /// `None` when a key column came through null.
    fn from_projected(fields: &FieldMap) -> Option<Self>;
}

fn text(fields: &FieldMap, name: &str) -> Option<String> {
    fields.get(name).and_then(Scalar::as_str).map(str::to_string)
}

fn float(fields: &FieldMap, name: &str) -> Option<f64> {
    fields.get(name).and_then(Scalar::as_f64)
}

fn int(fields: &FieldMap, name: &str) -> Option<i64> {
    fields.get(name).and_then(Scalar::as_i64)
}

impl Dimension for Song {
    type Source = SongRecord;

    fn default_projection() -> Projection {
        Projection::identity(&["song_id", "title", "artist_id", "year", "duration"])
    }

    fn from_projected(fields: &FieldMap) -> Option<Self> {
        Some(Song {
            song_id: text(fields, "song_id")?,
            title: text(fields, "title")?,
            artist_id: text(fields, "artist_id")?,
            year: int(fields, "year")?,
            duration: float(fields, "duration")?,
        })
    }
}

impl Dimension for Artist {
    type Source = SongRecord;

    fn default_projection() -> Projection {
        Projection::new(&[
            ("artist_id", "artist_id"),
            ("artist_name", "name"),
            ("artist_location", "location"),
            ("artist_latitude", "latitude"),
            ("artist_longitude", "longitude"),
        ])
    }

    fn from_projected(fields: &FieldMap) -> Option<Self> {
        Some(Artist {
            artist_id: text(fields, "artist_id")?,
            name: text(fields, "name"),
            location: text(fields, "location"),
            latitude: float(fields, "latitude"),
            longitude: float(fields, "longitude"),
        })
    }
}

impl Dimension for User {
    type Source = EventRecord;

    fn default_projection() -> Projection {
        Projection::new(&[
            ("user_id", "user_id"),
            ("user_first_name", "first_name"),
            ("user_last_name", "last_name"),
            ("user_gender", "gender"),
            ("user_level", "level"),
        ])
    }

    fn admits(record: &EventRecord) -> bool {
        record.is_page(NEXT_SONG_PAGE)
    }

    fn from_projected(fields: &FieldMap) -> Option<Self> {
        Some(User {
            user_id: text(fields, "user_id")?,
            first_name: text(fields, "first_name"),
            last_name: text(fields, "last_name"),
            gender: text(fields, "gender"),
            level: text(fields, "level"),
        })
    }
}

impl Dimension for TimePart {
    type Source = EventRecord;

    fn default_projection() -> Projection {
        Projection::new(&[("ts", "start_time")])
    }

    fn admits(record: &EventRecord) -> bool {
        record.is_page(NEXT_SONG_PAGE)
    }

    fn from_projected(fields: &FieldMap) -> Option<Self> {
        let millis = int(fields, "start_time")?;
        start_time_from_millis(millis).map(TimePart::from_start_time)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DimensionStats {
    pub considered: usize,
    pub null_key: usize,
    pub duplicates_dropped: usize,
}

/// Deduplicated rows for one dimension table, carrying the table's partition
/// hint for the loader.
#[derive(Debug, Clone)]
pub struct DimensionBatch<D> {
    pub rows: Vec<D>,
    pub partition_by: Vec<String>,
    pub stats: DimensionStats,
}

impl<D: TableRow> DimensionBatch<D> {
    pub fn to_rows(&self) -> Vec<Row> {
        self.rows.iter().map(TableRow::to_row).collect()
    }
}

/// Project, drop rows with a null key, then drop exact duplicates keeping
/// first-seen order.
///
/// Rows that agree on the key but differ elsewhere are all kept; the loader
/// decides between them.
#[instrument(skip(records, projection, table), fields(table = %table.id))]
pub fn build_dimension<D: Dimension>(
    records: &[D::Source],
    projection: &Projection,
    table: &TableSpec,
) -> Result<DimensionBatch<D>> {
    let mut seen: HashSet<Row> = HashSet::new();
    let mut rows = Vec::new();
    let mut stats = DimensionStats::default();

    for record in records.iter().filter(|r| D::admits(r)) {
        stats.considered += 1;
        let fields = projection.apply(record)?;
        let Some(row) = D::from_projected(&fields) else {
            stats.null_key += 1;
            continue;
        };
        if seen.insert(row.to_row()) {
            rows.push(row);
        } else {
            stats.duplicates_dropped += 1;
        }
    }

    debug!(
        "Built {} {} rows ({} duplicates, {} null keys)",
        rows.len(),
        table.id,
        stats.duplicates_dropped,
        stats.null_key
    );
    let label = ("table", table.name().to_string());
    metrics::increment(MetricName::DimensionRowsBuilt, label.clone(), rows.len() as u64);
    metrics::increment(
        MetricName::DimensionDuplicatesDropped,
        label,
        stats.duplicates_dropped as u64,
    );

    Ok(DimensionBatch {
        rows,
        partition_by: table.partition_by.clone(),
        stats,
    })
}

/// [`build_dimension`] with the dimension's default projection.
pub fn build_default<D: Dimension>(
    records: &[D::Source],
    table: &TableSpec,
) -> Result<DimensionBatch<D>> {
    build_dimension(records, &D::default_projection(), table)
}
