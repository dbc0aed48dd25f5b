//! Metrics for the ETL run.
//!
//! Names live in one enum so call sites never spell a metric by hand. The
//! `metrics` facade is a no-op until [`init_metrics`] installs a recorder.

use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Normalize
    NormalizeEntriesRead,
    NormalizeRecordsParsed,
    NormalizeParseFailures,

    // Dimension builder
    DimensionRowsBuilt,
    DimensionDuplicatesDropped,

    // Fact resolver
    ResolverMatched,
    ResolverUnmatched,
    ResolverAmbiguous,

    // Loader
    LoaderRowsInserted,
    LoaderRowsSkippedExisting,
    LoaderKeyConflicts,
    LoaderPartitionsReplaced,

    // Run
    StageDuration,
    RunsTotal,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NormalizeEntriesRead => "sparkify_normalize_entries_read_total",
            MetricName::NormalizeRecordsParsed => "sparkify_normalize_records_parsed_total",
            MetricName::NormalizeParseFailures => "sparkify_normalize_parse_failures_total",
            MetricName::DimensionRowsBuilt => "sparkify_dimension_rows_built_total",
            MetricName::DimensionDuplicatesDropped => "sparkify_dimension_duplicates_dropped_total",
            MetricName::ResolverMatched => "sparkify_resolver_matched_total",
            MetricName::ResolverUnmatched => "sparkify_resolver_unmatched_total",
            MetricName::ResolverAmbiguous => "sparkify_resolver_ambiguous_total",
            MetricName::LoaderRowsInserted => "sparkify_loader_rows_inserted_total",
            MetricName::LoaderRowsSkippedExisting => "sparkify_loader_rows_skipped_existing_total",
            MetricName::LoaderKeyConflicts => "sparkify_loader_key_conflicts_total",
            MetricName::LoaderPartitionsReplaced => "sparkify_loader_partitions_replaced_total",
            MetricName::StageDuration => "sparkify_stage_duration_seconds",
            MetricName::RunsTotal => "sparkify_runs_total",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn increment(name: MetricName, label: (&'static str, String), value: u64) {
    ::metrics::counter!(name.as_str(), label.0 => label.1).increment(value);
}

pub fn record_stage_duration(stage: &'static str, secs: f64) {
    ::metrics::histogram!(MetricName::StageDuration.as_str(), "stage" => stage).record(secs);
}

/// Install a Prometheus recorder with an HTTP listener at `addr`.
///
/// Idempotent. Without an address the facade stays a no-op.
pub fn init_metrics(addr: Option<&str>) {
    let Some(addr_str) = addr else {
        return;
    };
    INIT.call_once(|| match addr_str.parse::<std::net::SocketAddr>() {
        Ok(addr) => {
            let builder =
                metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
            match builder.install() {
                Ok(()) => info!("Prometheus exporter listening at http://{}/metrics", addr),
                Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
            }
        }
        Err(_) => warn!("Invalid metrics addr '{}', metrics disabled", addr_str),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique_and_prefixed() {
        let all = [
            MetricName::NormalizeEntriesRead,
            MetricName::NormalizeRecordsParsed,
            MetricName::NormalizeParseFailures,
            MetricName::DimensionRowsBuilt,
            MetricName::DimensionDuplicatesDropped,
            MetricName::ResolverMatched,
            MetricName::ResolverUnmatched,
            MetricName::ResolverAmbiguous,
            MetricName::LoaderRowsInserted,
            MetricName::LoaderRowsSkippedExisting,
            MetricName::LoaderKeyConflicts,
            MetricName::LoaderPartitionsReplaced,
            MetricName::StageDuration,
            MetricName::RunsTotal,
        ];
        let names: HashSet<&str> = all.iter().map(|m| m.as_str()).collect();
        assert_eq!(names.len(), all.len());
        assert!(names.iter().all(|n| n.starts_with("sparkify_")));
    }
}
