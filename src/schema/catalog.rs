use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use super::{declared, DeclaredSchema, Row, RowKey};
use crate::config::TableNames;
use crate::error::{EtlError, Result};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier regex"));

/// A table or column name that has been validated once and is safe to splice
/// into SQL text. Values are never spliced; they are always bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: &str) -> Result<Self> {
        validate_identifier(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(EtlError::InvalidIdentifier(name.to_string()))
    }
}

/// Table identity plus declared columns, natural key and partition hints.
#[derive(Debug, Clone, Serialize)]
pub struct TableSpec {
    pub id: TableId,
    pub schema: DeclaredSchema,
    pub key: Vec<String>,
    pub partition_by: Vec<String>,
    #[serde(skip)]
    key_indices: Vec<usize>,
    #[serde(skip)]
    partition_indices: Vec<usize>,
}

impl TableSpec {
    pub fn new(
        id: TableId,
        schema: DeclaredSchema,
        key: &[&str],
        partition_by: &[&str],
    ) -> Result<Self> {
        for column in schema.names() {
            validate_identifier(column)?;
        }
        let lookup = |name: &&str| {
            schema.index_of(name).ok_or_else(|| {
                EtlError::Config(format!("table '{}' has no column '{}'", id, name))
            })
        };
        let key_indices = key.iter().map(lookup).collect::<Result<Vec<_>>>()?;
        let partition_indices = partition_by.iter().map(lookup).collect::<Result<Vec<_>>>()?;

        if key_indices.is_empty() {
            return Err(EtlError::Config(format!("table '{}' declares no key", id)));
        }
        for &i in &key_indices {
            if schema.columns[i].nullable {
                return Err(EtlError::Config(format!(
                    "key column '{}' of table '{}' must be non-nullable",
                    schema.columns[i].name, id
                )));
            }
        }

        Ok(Self {
            id,
            schema,
            key: key.iter().map(|s| s.to_string()).collect(),
            partition_by: partition_by.iter().map(|s| s.to_string()).collect(),
            key_indices,
            partition_indices,
        })
    }

    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    pub fn partition_indices(&self) -> &[usize] {
        &self.partition_indices
    }

    pub fn key_of(&self, row: &Row) -> RowKey {
        RowKey::from_scalars(self.key_indices.iter().filter_map(|&i| row.get(i)))
    }

    /// `col=value` pairs identifying the partition a row belongs to.
    pub fn partition_of(&self, row: &Row) -> Vec<(String, String)> {
        self.partition_at(row, &self.partition_indices)
    }

    /// Resolve partition column names against this table's schema.
    pub fn column_indices(&self, columns: &[String]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|name| {
                self.schema.index_of(name).ok_or_else(|| {
                    EtlError::Config(format!("table '{}' has no column '{}'", self.id, name))
                })
            })
            .collect()
    }

    pub fn partition_at(&self, row: &Row, indices: &[usize]) -> Vec<(String, String)> {
        indices
            .iter()
            .map(|&i| {
                let value = row.get(i).map(|v| v.key_repr()).unwrap_or_default();
                (self.schema.columns[i].name.clone(), value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StarTable {
    Songs,
    Artists,
    Users,
    Time,
    SongPlays,
}

impl StarTable {
    /// Dimensions first; the fact table resolves against completed dimensions.
    pub const LOAD_ORDER: [StarTable; 5] = [
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Users,
        StarTable::Time,
        StarTable::SongPlays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StarTable::Songs => "songs",
            StarTable::Artists => "artists",
            StarTable::Users => "users",
            StarTable::Time => "time",
            StarTable::SongPlays => "songplays",
        }
    }
}

/// The star schema resolved against the configured table names, built once at
/// startup and passed by reference.
#[derive(Debug, Clone)]
pub struct StarSchema {
    pub songs: TableSpec,
    pub artists: TableSpec,
    pub users: TableSpec,
    pub time: TableSpec,
    pub songplays: TableSpec,
}

impl StarSchema {
    pub fn from_names(names: &TableNames) -> Result<Self> {
        Ok(Self {
            songs: TableSpec::new(
                TableId::new(&names.songs)?,
                declared::songs_table(),
                &["song_id"],
                &["year", "artist_id"],
            )?,
            artists: TableSpec::new(
                TableId::new(&names.artists)?,
                declared::artists_table(),
                &["artist_id"],
                &["artist_id"],
            )?,
            users: TableSpec::new(
                TableId::new(&names.users)?,
                declared::users_table(),
                &["user_id"],
                &[],
            )?,
            time: TableSpec::new(
                TableId::new(&names.time)?,
                declared::time_table(),
                &["start_time"],
                &["year", "month"],
            )?,
            songplays: TableSpec::new(
                TableId::new(&names.songplays)?,
                declared::songplays_table(),
                &["user_id", "start_time", "session_id"],
                &[],
            )?,
        })
    }

    pub fn table(&self, table: StarTable) -> &TableSpec {
        match table {
            StarTable::Songs => &self.songs,
            StarTable::Artists => &self.artists,
            StarTable::Users => &self.users,
            StarTable::Time => &self.time,
            StarTable::SongPlays => &self.songplays,
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        StarTable::LOAD_ORDER.iter().map(move |t| self.table(*t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Scalar;

    #[test]
    fn test_table_id_rejects_injection() {
        assert!(TableId::new("songs").is_ok());
        assert!(TableId::new("dim_time_2018").is_ok());
        assert!(TableId::new("songs; DROP TABLE users").is_err());
        assert!(TableId::new("1songs").is_err());
        assert!(TableId::new("").is_err());
    }

    #[test]
    fn test_star_schema_keys_and_partitions() {
        let star = StarSchema::from_names(&TableNames::default()).unwrap();
        assert_eq!(star.songplays.key, vec!["user_id", "start_time", "session_id"]);
        assert_eq!(star.songs.partition_by, vec!["year", "artist_id"]);

        let row = Row::new(vec![
            Scalar::from("SOAAA1"),
            Scalar::from("X"),
            Scalar::from("AR1"),
            Scalar::Int(2000),
            Scalar::Float(180.5),
        ]);
        assert_eq!(star.songs.key_of(&row), RowKey(vec!["SOAAA1".into()]));
        assert_eq!(
            star.songs.partition_of(&row),
            vec![
                ("year".to_string(), "2000".to_string()),
                ("artist_id".to_string(), "AR1".to_string())
            ]
        );
    }

    #[test]
    fn test_nullable_key_is_rejected() {
        use crate::schema::{ColumnSpec, LogicalType};
        let schema = DeclaredSchema::new(vec![ColumnSpec::nullable("id", LogicalType::Text)]);
        let err = TableSpec::new(TableId::new("t").unwrap(), schema, &["id"], &[]).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }
}
