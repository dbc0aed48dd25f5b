//! Record normalizer: raw JSON entries -> records coerced against a declared
//! schema.
//!
//! Each entry is first parsed as one self-contained document. If that fails
//! it is re-read as newline-delimited JSON, one record per line. A line that
//! still does not parse becomes an [`Normalized::Unparseable`] marker so one
//! bad line cannot abort a batch; what to do about markers is the caller's
//! decision. A missing required field is different: it surfaces as
//! [`EtlError::SchemaViolation`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tracing::{debug, instrument, warn};

use crate::domain::{FieldMap, NormalizedRecord, RecordKind, SourceRecord};
use crate::error::{EtlError, Result};
use crate::metrics::{self, MetricName};
use crate::schema::DeclaredSchema;
use crate::source::Source;

/// An entry (or one line of it) that could not be parsed as a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseFailure {
    pub entry: String,
    pub line: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(NormalizedRecord),
    Unparseable(ParseFailure),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub entries: usize,
    pub records: usize,
    pub parse_failures: usize,
}

impl NormalizeStats {
    /// Share of unparseable items among everything the stream yielded.
    pub fn failure_ratio(&self) -> f64 {
        let total = self.records + self.parse_failures;
        if total == 0 {
            0.0
        } else {
            self.parse_failures as f64 / total as f64
        }
    }
}

/// Lazy, finite, non-restartable sequence of normalized records.
///
/// Entries are listed up front; each entry is read only when the previous
/// one has been drained.
pub struct RecordStream<'a> {
    source: &'a dyn Source,
    schema: &'a DeclaredSchema,
    kind: RecordKind,
    entries: VecDeque<String>,
    pending: VecDeque<Result<Normalized>>,
    stats: NormalizeStats,
}

impl<'a> RecordStream<'a> {
    pub async fn open(
        source: &'a dyn Source,
        location: &str,
        schema: &'a DeclaredSchema,
        kind: RecordKind,
    ) -> Result<RecordStream<'a>> {
        let entries = source.list_entries(location).await?;
        debug!("Opened {} stream over {} entries at {}", kind, entries.len(), location);
        Ok(Self {
            source,
            schema,
            kind,
            entries: entries.into(),
            pending: VecDeque::new(),
            stats: NormalizeStats::default(),
        })
    }

    pub fn stats(&self) -> NormalizeStats {
        self.stats
    }

    pub async fn next(&mut self) -> Option<Result<Normalized>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                match &item {
                    Ok(Normalized::Record(_)) => self.stats.records += 1,
                    Ok(Normalized::Unparseable(_)) => self.stats.parse_failures += 1,
                    Err(_) => {}
                }
                return Some(item);
            }

            let entry = self.entries.pop_front()?;
            let bytes = match self.source.read_entry(&entry).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Nothing after a transport failure is trustworthy.
                    self.entries.clear();
                    return Some(Err(e));
                }
            };
            self.stats.entries += 1;

            for raw in parse_entry(&entry, &bytes) {
                let item = match raw {
                    RawItem::Object { line, object } => {
                        coerce_object(&entry, line, &object, self.schema, self.kind)
                            .map(Normalized::Record)
                    }
                    RawItem::Failure(failure) => {
                        debug!(
                            entry = %failure.entry,
                            line = ?failure.line,
                            "Unparseable {} entry: {}",
                            self.kind,
                            failure.reason
                        );
                        Ok(Normalized::Unparseable(failure))
                    }
                };
                self.pending.push_back(item);
            }
        }
    }
}

enum RawItem {
    Object {
        line: Option<usize>,
        object: Map<String, Value>,
    },
    Failure(ParseFailure),
}

fn failure(entry: &str, line: Option<usize>, reason: impl Into<String>) -> RawItem {
    RawItem::Failure(ParseFailure {
        entry: entry.to_string(),
        line,
        reason: reason.into(),
    })
}

fn parse_entry(entry: &str, bytes: &[u8]) -> Vec<RawItem> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return vec![failure(entry, None, format!("invalid UTF-8: {}", e))],
    };

    // Whole document first
    if let Ok(document) = serde_json::from_str::<Value>(text) {
        return match document {
            Value::Object(object) => vec![RawItem::Object { line: None, object }],
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(object) => RawItem::Object { line: None, object },
                    _ => failure(entry, None, format!("array element {} is not an object", i)),
                })
                .collect(),
            _ => vec![failure(entry, None, "document is not a JSON object")],
        };
    }

    // Then one record per line
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => RawItem::Object {
                line: Some(i + 1),
                object,
            },
            Ok(_) => failure(entry, Some(i + 1), "line is not a JSON object"),
            Err(e) => failure(entry, Some(i + 1), e.to_string()),
        })
        .collect()
}

fn coerce_object(
    entry: &str,
    line: Option<usize>,
    object: &Map<String, Value>,
    schema: &DeclaredSchema,
    kind: RecordKind,
) -> Result<NormalizedRecord> {
    let mut fields = FieldMap::new();
    for column in &schema.columns {
        let value = column.logical_type.coerce(object.get(column.source_field()));
        if value.is_null() && !column.nullable {
            let location = match line {
                Some(line) => format!("{}:{}", entry, line),
                None => entry.to_string(),
            };
            return Err(EtlError::SchemaViolation {
                kind: kind.to_string(),
                entry: location,
                field: column.name.clone(),
            });
        }
        fields.insert(column.name.clone(), value);
    }
    Ok(NormalizedRecord {
        entry: entry.to_string(),
        line,
        fields,
    })
}

/// Typed records of one kind read from a location, plus the markers for
/// everything that could not be parsed.
#[derive(Debug, Clone)]
pub struct NormalizedBatch<R> {
    pub records: Vec<R>,
    pub failures: Vec<ParseFailure>,
    pub stats: NormalizeStats,
}

/// Drain a [`RecordStream`] into typed records.
#[instrument(skip(source), fields(kind = %R::KIND))]
pub async fn read_records<R: SourceRecord>(
    source: &dyn Source,
    location: &str,
) -> Result<NormalizedBatch<R>> {
    let mut stream = RecordStream::open(source, location, R::schema(), R::KIND).await?;
    let mut records = Vec::new();
    let mut failures = Vec::new();

    while let Some(item) = stream.next().await {
        match item? {
            Normalized::Record(record) => records.push(R::from_normalized(&record)?),
            Normalized::Unparseable(f) => failures.push(f),
        }
    }

    let stats = stream.stats();
    let label = ("kind", R::KIND.to_string());
    metrics::increment(MetricName::NormalizeEntriesRead, label.clone(), stats.entries as u64);
    metrics::increment(MetricName::NormalizeRecordsParsed, label.clone(), stats.records as u64);
    metrics::increment(MetricName::NormalizeParseFailures, label, stats.parse_failures as u64);

    if stats.parse_failures > 0 {
        warn!(
            "{} of {} {} items unparseable under {}",
            stats.parse_failures,
            stats.records + stats.parse_failures,
            R::KIND,
            location
        );
    }

    Ok(NormalizedBatch {
        records,
        failures,
        stats,
    })
}
