//! Relational sink backed by SQLite.
//!
//! Table and column names come from validated [`TableSpec`]s and are the only
//! text spliced into SQL; every value is bound. Each table gets a UNIQUE
//! constraint over its key so a row slipped in by a concurrent writer between
//! snapshot and append is rejected instead of duplicated.

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{CreateMode, Sink};
use crate::error::{EtlError, Result};
use crate::schema::{Row, RowKey, Scalar, TableSpec, TIMESTAMP_FORMAT};

pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!("Opened SQLite sink at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self, spec: &TableSpec) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EtlError::sink(spec.name(), "connection lock poisoned"))
    }

    /// Number of rows currently in `spec`'s table.
    pub fn count_rows(&self, spec: &TableSpec) -> Result<usize> {
        let conn = self.lock(spec)?;
        let sql = format!("SELECT COUNT(*) FROM {}", spec.id.quoted());
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        Ok(count as usize)
    }
}

fn quote(column: &str) -> String {
    format!("\"{}\"", column)
}

fn create_sql(spec: &TableSpec) -> String {
    let mut parts: Vec<String> = spec
        .schema
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote(&c.name), c.logical_type.sql_type(), null)
        })
        .collect();
    let key: Vec<String> = spec.key.iter().map(|k| quote(k)).collect();
    parts.push(format!("UNIQUE ({})", key.join(", ")));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        spec.id.quoted(),
        parts.join(",\n    ")
    )
}

fn insert_sql(spec: &TableSpec) -> String {
    let columns: Vec<String> = spec.schema.names().map(quote).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        spec.id.quoted(),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn to_sql_value(value: &Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Int(v) => Value::Integer(*v),
        Scalar::Float(v) => Value::Real(*v),
        Scalar::Text(s) => Value::Text(s.clone()),
        Scalar::Timestamp(ts) => Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

/// Must agree with [`Scalar::key_repr`] for keys to compare across the sink
/// boundary.
fn key_part(value: Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(s) => s,
        Value::Blob(b) => hex::encode(b),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl Sink for SqliteSink {
    async fn create_table(&self, spec: &TableSpec, mode: CreateMode) -> Result<()> {
        let conn = self.lock(spec)?;
        if mode == CreateMode::Replace {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", spec.id.quoted()), [])
                .map_err(|e| EtlError::sink(spec.name(), e))?;
        }
        conn.execute(&create_sql(spec), [])
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        debug!("Ensured table {} ({:?})", spec.id, mode);
        Ok(())
    }

    /// All rows land in one transaction; a failure leaves the table as it was.
    async fn append_rows(&self, spec: &TableSpec, rows: &[Row]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock(spec)?;
        let tx = conn
            .transaction()
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        {
            let mut stmt = tx
                .prepare(&insert_sql(spec))
                .map_err(|e| EtlError::sink(spec.name(), e))?;
            for row in rows {
                stmt.execute(params_from_iter(row.values().iter().map(to_sql_value)))
                    .map_err(|e| {
                        if is_constraint_violation(&e) {
                            EtlError::DuplicateKeyRace {
                                table: spec.name().to_string(),
                                key: spec.key_of(row).to_string(),
                            }
                        } else {
                            EtlError::sink(spec.name(), e)
                        }
                    })?;
            }
        }
        tx.commit().map_err(|e| EtlError::sink(spec.name(), e))?;
        debug!("Inserted {} rows into {}", rows.len(), spec.id);
        Ok(rows.len())
    }

    async fn existing_keys(&self, spec: &TableSpec) -> Result<HashSet<RowKey>> {
        let conn = self.lock(spec)?;
        let columns: Vec<String> = spec.key.iter().map(|k| quote(k)).collect();
        let sql = format!(
            "SELECT DISTINCT {} FROM {}",
            columns.join(", "),
            spec.id.quoted()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        let width = columns.len();
        let keys = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i).map(key_part))
                    .collect::<rusqlite::Result<Vec<String>>>()
                    .map(RowKey)
            })
            .map_err(|e| EtlError::sink(spec.name(), e))?
            .collect::<rusqlite::Result<HashSet<RowKey>>>()
            .map_err(|e| EtlError::sink(spec.name(), e))?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::schema::{parse_timestamp, StarSchema};

    fn star() -> StarSchema {
        StarSchema::from_names(&TableNames::default()).unwrap()
    }

    fn play(user_id: &str, start_time: &str, session_id: i64) -> Row {
        Row::new(vec![
            Scalar::Timestamp(parse_timestamp(start_time).unwrap()),
            Scalar::from(user_id),
            Scalar::from("free"),
            Scalar::Null,
            Scalar::Null,
            Scalar::Int(session_id),
            Scalar::Null,
            Scalar::Null,
        ])
    }

    #[test]
    fn test_create_sql_declares_unique_key() {
        let sql = create_sql(&star().songplays);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"songplays\""));
        assert!(sql.contains("\"start_time\" TEXT NOT NULL"));
        assert!(sql.contains("\"song_id\" TEXT,"));
        assert!(sql.contains("UNIQUE (\"user_id\", \"start_time\", \"session_id\")"));
    }

    #[tokio::test]
    async fn test_composite_keys_read_back_like_rows() {
        let star = star();
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.create_table(&star.songplays, CreateMode::Replace).await.unwrap();

        let row = play("8", "2020-09-13 12:26:40", 139);
        sink.append_rows(&star.songplays, &[row.clone()]).await.unwrap();

        let keys = sink.existing_keys(&star.songplays).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&star.songplays.key_of(&row)));
    }

    #[tokio::test]
    async fn test_duplicate_key_rolls_back_append() {
        let star = star();
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.create_table(&star.songplays, CreateMode::IfAbsent).await.unwrap();
        sink.append_rows(&star.songplays, &[play("8", "2020-09-13 12:26:40", 1)])
            .await
            .unwrap();

        let err = sink
            .append_rows(
                &star.songplays,
                &[play("9", "2020-09-13 12:30:00", 1), play("8", "2020-09-13 12:26:40", 1)],
            )
            .await
            .unwrap_err();
        match err {
            EtlError::DuplicateKeyRace { table, key } => {
                assert_eq!(table, "songplays");
                assert_eq!(key, "(8, 2020-09-13 12:26:40, 1)");
            }
            other => panic!("expected duplicate key race, got {:?}", other),
        }
        assert_eq!(sink.count_rows(&star.songplays).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_drops_existing_rows() {
        let star = star();
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.create_table(&star.songplays, CreateMode::IfAbsent).await.unwrap();
        sink.append_rows(&star.songplays, &[play("8", "2020-09-13 12:26:40", 1)])
            .await
            .unwrap();
        sink.create_table(&star.songplays, CreateMode::Replace).await.unwrap();
        assert!(sink.existing_keys(&star.songplays).await.unwrap().is_empty());
    }
}
