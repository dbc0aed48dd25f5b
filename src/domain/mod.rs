//! Domain data shapes: raw record kinds and star-schema rows.

pub mod records;
pub mod rows;

pub use records::{
    EventRecord, FieldMap, NormalizedRecord, Record, RecordKind, SongRecord, SourceRecord,
};
pub use rows::{start_time_from_millis, to_rows, Artist, Song, SongPlay, TableRow, TimePart, User};
