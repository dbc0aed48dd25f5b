//! Hand-declared schemas. One fixed shape per run; no evolution.

use once_cell::sync::Lazy;

use super::{ColumnSpec, DeclaredSchema, LogicalType::*};

static SONG_RECORD: Lazy<DeclaredSchema> = Lazy::new(|| {
    DeclaredSchema::new(vec![
        ColumnSpec::required("artist_id", Text),
        ColumnSpec::nullable("artist_latitude", Double),
        ColumnSpec::nullable("artist_longitude", Double),
        ColumnSpec::nullable("artist_location", Text),
        ColumnSpec::required("artist_name", Text),
        ColumnSpec::required("song_id", Text),
        ColumnSpec::required("title", Text),
        ColumnSpec::required("duration", Double),
        ColumnSpec::required("year", Integer),
        ColumnSpec::nullable("num_songs", Integer),
    ])
});

// Log files use camelCase keys; `source` maps them onto snake_case columns.
static EVENT_RECORD: Lazy<DeclaredSchema> = Lazy::new(|| {
    DeclaredSchema::new(vec![
        ColumnSpec::nullable("artist_name", Text).from_field("artist"),
        ColumnSpec::nullable("auth", Text),
        ColumnSpec::nullable("user_first_name", Text).from_field("firstName"),
        ColumnSpec::nullable("user_gender", Text).from_field("gender"),
        ColumnSpec::nullable("item_in_session", Integer).from_field("itemInSession"),
        ColumnSpec::nullable("user_last_name", Text).from_field("lastName"),
        ColumnSpec::nullable("song_length", Double).from_field("length"),
        ColumnSpec::nullable("user_level", Text).from_field("level"),
        ColumnSpec::nullable("location", Text),
        ColumnSpec::nullable("method", Text),
        ColumnSpec::nullable("page", Text),
        ColumnSpec::nullable("registration", Double),
        ColumnSpec::required("session_id", Integer).from_field("sessionId"),
        ColumnSpec::nullable("song_title", Text).from_field("song"),
        ColumnSpec::nullable("status", Integer),
        ColumnSpec::required("ts", Integer),
        ColumnSpec::nullable("user_agent", Text).from_field("userAgent"),
        ColumnSpec::nullable("user_id", Text).from_field("userId"),
    ])
});

pub fn song_record() -> &'static DeclaredSchema {
    &SONG_RECORD
}

pub fn event_record() -> &'static DeclaredSchema {
    &EVENT_RECORD
}

pub fn songs_table() -> DeclaredSchema {
    DeclaredSchema::new(vec![
        ColumnSpec::required("song_id", Text),
        ColumnSpec::required("title", Text),
        ColumnSpec::required("artist_id", Text),
        ColumnSpec::required("year", Integer),
        ColumnSpec::required("duration", Double),
    ])
}

pub fn artists_table() -> DeclaredSchema {
    DeclaredSchema::new(vec![
        ColumnSpec::required("artist_id", Text),
        ColumnSpec::nullable("name", Text),
        ColumnSpec::nullable("location", Text),
        ColumnSpec::nullable("latitude", Double),
        ColumnSpec::nullable("longitude", Double),
    ])
}

pub fn users_table() -> DeclaredSchema {
    DeclaredSchema::new(vec![
        ColumnSpec::required("user_id", Text),
        ColumnSpec::nullable("first_name", Text),
        ColumnSpec::nullable("last_name", Text),
        ColumnSpec::nullable("gender", Text),
        ColumnSpec::nullable("level", Text),
    ])
}

pub fn time_table() -> DeclaredSchema {
    DeclaredSchema::new(vec![
        ColumnSpec::required("start_time", Timestamp),
        ColumnSpec::required("hour", Integer),
        ColumnSpec::required("day", Integer),
        ColumnSpec::required("week", Integer),
        ColumnSpec::required("month", Integer),
        ColumnSpec::required("year", Integer),
        ColumnSpec::required("weekday", Integer),
    ])
}

pub fn songplays_table() -> DeclaredSchema {
    DeclaredSchema::new(vec![
        ColumnSpec::required("start_time", Timestamp),
        ColumnSpec::required("user_id", Text),
        ColumnSpec::nullable("level", Text),
        ColumnSpec::nullable("song_id", Text),
        ColumnSpec::nullable("artist_id", Text),
        ColumnSpec::required("session_id", Integer),
        ColumnSpec::nullable("location", Text),
        ColumnSpec::nullable("user_agent", Text),
    ])
}
