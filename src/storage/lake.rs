//! Partitioned file lake sink.
//!
//! Layout:
//!
//! ```text
//! <root>/<table>/_schema.json
//! <root>/<table>/<col>=<val>/.../part-00000.jsonl
//! <root>/<table>/<col>=<val>/.../_manifest.json
//! ```
//!
//! An unpartitioned table keeps its single part file directly under the table
//! directory. A partition is replaced by writing the new part file and
//! manifest into a staging directory and renaming them over the live files.
//! The live manifest is removed before the part file is swapped, so a manifest
//! that exists always describes the part file next to it.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{CreateMode, PartitionSink, PartitionValues, Sink};
use crate::constants::{MANIFEST_FILE_NAME, PART_FILE_NAME, SCHEMA_FILE_NAME, STAGING_DIR_PREFIX};
use crate::error::{EtlError, Result};
use crate::schema::{Row, RowKey, TableSpec};

pub struct LakeSink {
    root: PathBuf,
}

#[derive(Debug, Serialize)]
struct PartitionManifest<'a> {
    table: &'a str,
    partition: BTreeMap<&'a str, &'a str>,
    rows: usize,
    sha256: String,
    written_at: String,
}

impl LakeSink {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, spec: &TableSpec) -> PathBuf {
        self.root.join(spec.name())
    }

    pub fn partition_dir(&self, spec: &TableSpec, partition: &PartitionValues) -> PathBuf {
        partition
            .iter()
            .fold(self.table_dir(spec), |dir, (column, value)| {
                dir.join(format!("{}={}", column, escape_partition_value(value)))
            })
    }

    fn ensure_table(&self, spec: &TableSpec) -> Result<PathBuf> {
        let dir = self.table_dir(spec);
        if dir.join(SCHEMA_FILE_NAME).is_file() {
            Ok(dir)
        } else {
            Err(EtlError::sink(spec.name(), "table does not exist"))
        }
    }
}

/// Percent-encode anything that is not safe in a single path segment.
fn escape_partition_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

fn encode_rows(spec: &TableSpec, rows: &[Row]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        let object: Map<String, Value> = spec
            .schema
            .names()
            .zip(row.values())
            .map(|(name, value)| -> Result<(String, Value)> {
                Ok((name.to_string(), serde_json::to_value(value)?))
            })
            .collect::<Result<_>>()?;
        serde_json::to_writer(&mut out, &object)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn decode_rows(spec: &TableSpec, path: &Path, bytes: &[u8]) -> Result<Vec<Row>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EtlError::sink(spec.name(), format!("{}: {}", path.display(), e)))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> Result<Row> {
            let object: Map<String, Value> = serde_json::from_str(line)?;
            Ok(Row::new(
                spec.schema
                    .columns
                    .iter()
                    .map(|c| c.logical_type.coerce(object.get(&c.name)))
                    .collect(),
            ))
        })
        .collect()
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn is_staging(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with(STAGING_DIR_PREFIX))
        .unwrap_or(false)
}

#[async_trait]
impl Sink for LakeSink {
    async fn create_table(&self, spec: &TableSpec, mode: CreateMode) -> Result<()> {
        let dir = self.table_dir(spec);
        if mode == CreateMode::Replace && dir.exists() {
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| EtlError::sink(spec.name(), e))?;
        }
        let schema_path = dir.join(SCHEMA_FILE_NAME);
        if schema_path.is_file() {
            return Ok(());
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        fs::write(&schema_path, serde_json::to_vec_pretty(spec)?)
            .await
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        info!("Created lake table {} at {}", spec.id, dir.display());
        Ok(())
    }

    /// Append by rewriting each touched partition with its old rows plus the
    /// new ones.
    async fn append_rows(&self, spec: &TableSpec, rows: &[Row]) -> Result<usize> {
        let mut groups: BTreeMap<PartitionValues, Vec<Row>> = BTreeMap::new();
        for row in rows {
            groups
                .entry(spec.partition_of(row))
                .or_default()
                .push(row.clone());
        }
        for (partition, new_rows) in groups {
            let mut merged = self.read_partition(spec, &partition).await?;
            merged.extend(new_rows);
            self.replace_partition(spec, &partition, &merged).await?;
        }
        Ok(rows.len())
    }

    async fn existing_keys(&self, spec: &TableSpec) -> Result<HashSet<RowKey>> {
        let dir = self.ensure_table(spec)?;
        let mut part_files = Vec::new();
        for item in WalkDir::new(&dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !is_staging(e))
        {
            let item = item.map_err(|e| EtlError::sink(spec.name(), e))?;
            if item.file_type().is_file() && item.file_name() == OsStr::new(PART_FILE_NAME) {
                part_files.push(item.into_path());
            }
        }

        let mut keys = HashSet::new();
        for path in part_files {
            let bytes = fs::read(&path)
                .await
                .map_err(|e| EtlError::sink(spec.name(), e))?;
            for row in decode_rows(spec, &path, &bytes)? {
                keys.insert(spec.key_of(&row));
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl PartitionSink for LakeSink {
    async fn read_partition(
        &self,
        spec: &TableSpec,
        partition: &PartitionValues,
    ) -> Result<Vec<Row>> {
        self.ensure_table(spec)?;
        let path = self.partition_dir(spec, partition).join(PART_FILE_NAME);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        decode_rows(spec, &path, &bytes)
    }

    async fn replace_partition(
        &self,
        spec: &TableSpec,
        partition: &PartitionValues,
        rows: &[Row],
    ) -> Result<()> {
        let table_dir = self.ensure_table(spec)?;
        let target = self.partition_dir(spec, partition);
        let staging = table_dir.join(format!("{}{}", STAGING_DIR_PREFIX, Uuid::new_v4()));
        let write_err = |e: std::io::Error| EtlError::PartitionWrite {
            table: spec.name().to_string(),
            message: format!("{}: {}", target.display(), e),
        };

        let data = encode_rows(spec, rows)?;
        let manifest = PartitionManifest {
            table: spec.name(),
            partition: partition
                .iter()
                .map(|(c, v)| (c.as_str(), v.as_str()))
                .collect(),
            rows: rows.len(),
            sha256: digest(&data),
            written_at: Utc::now().to_rfc3339(),
        };

        fs::create_dir_all(&target).await.map_err(write_err)?;
        fs::create_dir_all(&staging).await.map_err(write_err)?;
        let swapped = async {
            fs::write(staging.join(PART_FILE_NAME), &data).await?;
            fs::write(
                staging.join(MANIFEST_FILE_NAME),
                serde_json::to_vec_pretty(&manifest)?,
            )
            .await?;

            match fs::remove_file(target.join(MANIFEST_FILE_NAME)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            // Single-file renames within one filesystem are atomic.
            fs::rename(staging.join(PART_FILE_NAME), target.join(PART_FILE_NAME)).await?;
            fs::rename(
                staging.join(MANIFEST_FILE_NAME),
                target.join(MANIFEST_FILE_NAME),
            )
            .await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = fs::remove_dir_all(&staging).await {
            warn!("Could not remove staging dir {}: {}", staging.display(), e);
        }
        swapped.map_err(write_err)?;

        debug!(
            "Replaced partition {} of {} with {} rows",
            target.display(),
            spec.id,
            rows.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::schema::{Scalar, StarSchema};
    use tempfile::tempdir;

    fn song(song_id: &str, artist_id: &str, year: i64) -> Row {
        Row::new(vec![
            Scalar::from(song_id),
            Scalar::from("X"),
            Scalar::from(artist_id),
            Scalar::Int(year),
            Scalar::Float(180.5),
        ])
    }

    #[test]
    fn test_escape_partition_value() {
        assert_eq!(escape_partition_value("AR1"), "AR1");
        assert_eq!(escape_partition_value("a/b c"), "a%2Fb%20c");
    }

    #[tokio::test]
    async fn test_partition_layout_and_manifest() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        sink.create_table(&star.songs, CreateMode::IfAbsent).await.unwrap();

        let row = song("SOAAA1", "AR1", 2000);
        let partition = star.songs.partition_of(&row);
        sink.replace_partition(&star.songs, &partition, &[row.clone()])
            .await
            .unwrap();

        let part_dir = dir.path().join("songs").join("year=2000").join("artist_id=AR1");
        assert!(part_dir.join(PART_FILE_NAME).is_file());
        let manifest: Value =
            serde_json::from_slice(&std::fs::read(part_dir.join(MANIFEST_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(manifest["rows"], 1);
        let data = std::fs::read(part_dir.join(PART_FILE_NAME)).unwrap();
        assert_eq!(manifest["sha256"].as_str().unwrap(), digest(&data));

        assert_eq!(sink.read_partition(&star.songs, &partition).await.unwrap(), vec![row]);
        // No staging leftovers
        let leftovers = std::fs::read_dir(dir.path().join("songs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_append_then_existing_keys() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        sink.create_table(&star.songs, CreateMode::Replace).await.unwrap();

        sink.append_rows(&star.songs, &[song("SOA", "AR1", 2000), song("SOB", "AR2", 1999)])
            .await
            .unwrap();
        sink.append_rows(&star.songs, &[song("SOC", "AR1", 2000)])
            .await
            .unwrap();

        let keys = sink.existing_keys(&star.songs).await.unwrap();
        assert_eq!(keys.len(), 3);
        let partition = vec![
            ("year".to_string(), "2000".to_string()),
            ("artist_id".to_string(), "AR1".to_string()),
        ];
        assert_eq!(sink.read_partition(&star.songs, &partition).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timestamps_survive_round_trip() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        sink.create_table(&star.time, CreateMode::Replace).await.unwrap();

        let part = crate::domain::TimePart::from_start_time(
            crate::domain::start_time_from_millis(1_600_000_000_000).unwrap(),
        );
        let row = crate::domain::TableRow::to_row(&part);
        sink.append_rows(&star.time, &[row.clone()]).await.unwrap();
        let keys = sink.existing_keys(&star.time).await.unwrap();
        assert!(keys.contains(&star.time.key_of(&row)));
    }

    #[tokio::test]
    async fn test_failed_swap_leaves_no_staging_dir() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        sink.create_table(&star.songs, CreateMode::IfAbsent).await.unwrap();

        let row = song("SOAAA1", "AR1", 2000);
        let partition = star.songs.partition_of(&row);
        // A non-empty directory where the part file should go blocks the rename
        let blocker = sink.partition_dir(&star.songs, &partition).join(PART_FILE_NAME);
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let err = sink
            .replace_partition(&star.songs, &partition, &[row])
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::PartitionWrite { .. }));

        let leftovers = std::fs::read_dir(dir.path().join("songs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_error_surfaces_from_existing_keys() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        sink.create_table(&star.users, CreateMode::IfAbsent).await.unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("does-not-exist"),
            sink.table_dir(&star.users).join("dangling"),
        )
        .unwrap();

        let err = sink.existing_keys(&star.users).await.unwrap_err();
        assert!(matches!(err, EtlError::SinkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_table_is_sink_unavailable() {
        let dir = tempdir().unwrap();
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        let sink = LakeSink::new(dir.path());
        let err = sink.existing_keys(&star.users).await.unwrap_err();
        assert!(matches!(err, EtlError::SinkUnavailable { .. }));
    }
}
