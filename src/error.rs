use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    /// A non-nullable field was absent or null on an otherwise parseable record.
    #[error("Schema violation in {kind} record from '{entry}': required field '{field}' is missing or null")]
    SchemaViolation {
        kind: String,
        entry: String,
        field: String,
    },

    #[error("Source unavailable at '{location}': {message}")]
    SourceUnavailable { location: String, message: String },

    #[error("Sink unavailable for table '{table}': {message}")]
    SinkUnavailable { table: String, message: String },

    /// A uniqueness constraint in the sink rejected an insert the anti-join
    /// computed as missing; another writer got there first.
    #[error("Duplicate key {key} in table '{table}' (concurrent writer?)")]
    DuplicateKeyRace { table: String, key: String },

    #[error("Partition write rejected for table '{table}': {message}")]
    PartitionWrite { table: String, message: String },

    #[error("Too many unparseable {kind} entries: {failures} of {total} (limit {limit:.2})")]
    ParseFailureRatio {
        kind: String,
        failures: usize,
        total: usize,
        limit: f64,
    },

    #[error("Invalid table identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn sink(table: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EtlError::SinkUnavailable {
            table: table.into(),
            message: err.to_string(),
        }
    }

    pub fn source(location: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EtlError::SourceUnavailable {
            location: location.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
