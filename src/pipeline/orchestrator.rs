//! Orchestrator: Normalizer -> Dimension Builder -> Fact Resolver -> Loader.
//!
//! Every dimension is built and loaded before the fact table is resolved. Any
//! surfaced error aborts the run; nothing spans tables, so recovery is running
//! the whole load again.

use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::dimension::{build_default, DimensionBatch};
use super::load::{merge_anti_join, overwrite_partitions, LoadReport};
use super::normalize::{read_records, NormalizeStats};
use super::resolve::{build_song_plays, ResolveStats};
use crate::config::EtlConfig;
use crate::domain::{
    to_rows, Artist, EventRecord, RecordKind, Song, SongRecord, TableRow, TimePart, User,
};
use crate::error::{EtlError, Result};
use crate::metrics::{self, MetricName};
use crate::schema::{Row, StarSchema, TableSpec};
use crate::source::Source;
use crate::storage::{CreateMode, PartitionSink, Sink};

/// Where a run loads to, and therefore how.
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// Relational store, anti-join merge.
    Merge(&'a dyn Sink),
    /// Partitioned store, overwrite-by-partition.
    Partitioned(&'a dyn PartitionSink),
}

impl<'a> Target<'a> {
    async fn create_table(&self, spec: &TableSpec, mode: CreateMode) -> Result<()> {
        match self {
            Target::Merge(sink) => sink.create_table(spec, mode).await,
            Target::Partitioned(sink) => sink.create_table(spec, mode).await,
        }
    }

    /// `partition_by` only matters to a partitioned target.
    async fn load(
        &self,
        spec: &TableSpec,
        rows: Vec<Row>,
        partition_by: &[String],
    ) -> Result<LoadReport> {
        match self {
            Target::Merge(sink) => merge_anti_join(*sink, spec, rows).await,
            Target::Partitioned(sink) => {
                overwrite_partitions(*sink, spec, rows, partition_by).await
            }
        }
    }

    async fn load_dimension<D: TableRow>(
        &self,
        spec: &TableSpec,
        batch: &DimensionBatch<D>,
    ) -> Result<LoadReport> {
        self.load(spec, batch.to_rows(), &batch.partition_by).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub song_data: String,
    pub log_data: String,
    pub songs_normalized: NormalizeStats,
    pub events_normalized: NormalizeStats,
    pub resolution: ResolveStats,
    pub loads: Vec<LoadReport>,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn load(&self, table: &str) -> Option<&LoadReport> {
        self.loads.iter().find(|l| l.table == table)
    }

    pub fn total_inserted(&self) -> usize {
        self.loads.iter().map(|l| l.inserted).sum()
    }
}

/// Source locations for one run.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub song_data: String,
    pub log_data: String,
    pub dry_run: bool,
}

impl RunInput {
    pub fn from_config(config: &EtlConfig, dry_run: bool) -> Self {
        let (song_data, log_data) = config.source.locations(dry_run);
        Self {
            song_data: song_data.to_string(),
            log_data: log_data.to_string(),
            dry_run,
        }
    }
}

pub struct Orchestrator<'a> {
    config: &'a EtlConfig,
    star: StarSchema,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a EtlConfig) -> Result<Self> {
        Ok(Self {
            config,
            star: StarSchema::from_names(&config.tables)?,
        })
    }

    pub fn star(&self) -> &StarSchema {
        &self.star
    }

    /// Drop and recreate every star table.
    pub async fn init_tables(&self, target: Target<'_>) -> Result<()> {
        for spec in self.star.tables() {
            target.create_table(spec, CreateMode::Replace).await?;
            info!("Created table {}", spec.id);
        }
        Ok(())
    }

    #[instrument(skip(self, source, target), fields(dry_run = input.dry_run))]
    pub async fn run(
        &self,
        source: &dyn Source,
        target: Target<'_>,
        input: &RunInput,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting run over {} and {}", input.song_data, input.log_data);

        let outcome = self.run_stages(run_id, source, target, input).await;
        let label = match &outcome {
            Ok(_) => "ok",
            Err(_) => "failed",
        };
        metrics::increment(MetricName::RunsTotal, ("outcome", label.to_string()), 1);
        if let Err(e) = &outcome {
            error!(%run_id, "Run failed: {}", e);
        }
        outcome
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        source: &dyn Source,
        target: Target<'_>,
        input: &RunInput,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let limit = self.config.run.max_parse_failure_ratio;

        let stage = Instant::now();
        let songs = read_records::<SongRecord>(source, &input.song_data).await?;
        check_parse_ratio(RecordKind::Song, &songs.stats, limit)?;
        let events = read_records::<EventRecord>(source, &input.log_data).await?;
        check_parse_ratio(RecordKind::Event, &events.stats, limit)?;
        metrics::record_stage_duration("normalize", stage.elapsed().as_secs_f64());

        for spec in self.star.tables() {
            target.create_table(spec, CreateMode::IfAbsent).await?;
        }

        let mut loads = Vec::new();

        let stage = Instant::now();
        let song_dim = build_default::<Song>(&songs.records, &self.star.songs)?;
        let artist_dim = build_default::<Artist>(&songs.records, &self.star.artists)?;
        let user_dim = build_default::<User>(&events.records, &self.star.users)?;
        let time_dim = build_default::<TimePart>(&events.records, &self.star.time)?;
        metrics::record_stage_duration("dimensions", stage.elapsed().as_secs_f64());

        let stage = Instant::now();
        loads.push(target.load_dimension(&self.star.songs, &song_dim).await?);
        loads.push(target.load_dimension(&self.star.artists, &artist_dim).await?);
        loads.push(target.load_dimension(&self.star.users, &user_dim).await?);
        loads.push(target.load_dimension(&self.star.time, &time_dim).await?);
        metrics::record_stage_duration("load_dimensions", stage.elapsed().as_secs_f64());

        let stage = Instant::now();
        let facts = build_song_plays(
            &events.records,
            &song_dim.rows,
            &artist_dim.rows,
            &self.config.resolver,
        );
        metrics::record_stage_duration("resolve", stage.elapsed().as_secs_f64());

        let stage = Instant::now();
        let songplays = &self.star.songplays;
        loads.push(target.load(songplays, to_rows(&facts.rows), &songplays.partition_by).await?);
        metrics::record_stage_duration("load_facts", stage.elapsed().as_secs_f64());

        let report = RunReport {
            run_id,
            dry_run: input.dry_run,
            song_data: input.song_data.clone(),
            log_data: input.log_data.clone(),
            songs_normalized: songs.stats,
            events_normalized: events.stats,
            resolution: facts.stats,
            loads,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            %run_id,
            "Run finished in {} ms: {} rows inserted",
            report.elapsed_ms,
            report.total_inserted()
        );
        Ok(report)
    }
}

fn check_parse_ratio(kind: RecordKind, stats: &NormalizeStats, limit: f64) -> Result<()> {
    if stats.failure_ratio() > limit {
        return Err(EtlError::ParseFailureRatio {
            kind: kind.to_string(),
            failures: stats.parse_failures,
            total: stats.records + stats.parse_failures,
            limit,
        });
    }
    Ok(())
}
