use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EtlError, Result};
use crate::schema::{declared, DeclaredSchema, Scalar};

/// Coerced field values keyed by column name.
pub type FieldMap = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Song,
    Event,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Song => f.write_str("song"),
            RecordKind::Event => f.write_str("event"),
        }
    }
}

/// One raw entry after coercion against a declared schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Source entry the record came from.
    pub entry: String,
    /// 1-based line number when the entry was read line by line.
    pub line: Option<usize>,
    pub fields: FieldMap,
}

impl NormalizedRecord {
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    fn violation(&self, kind: RecordKind, field: &str) -> EtlError {
        EtlError::SchemaViolation {
            kind: kind.to_string(),
            entry: self.location(),
            field: field.to_string(),
        }
    }

    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.entry, line),
            None => self.entry.clone(),
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(Scalar::as_str).map(str::to_string)
    }

    fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Scalar::as_i64)
    }

    fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Scalar::as_f64)
    }

    fn required_text(&self, kind: RecordKind, name: &str) -> Result<String> {
        self.text(name).ok_or_else(|| self.violation(kind, name))
    }

    fn required_int(&self, kind: RecordKind, name: &str) -> Result<i64> {
        self.int(name).ok_or_else(|| self.violation(kind, name))
    }

    fn required_float(&self, kind: RecordKind, name: &str) -> Result<f64> {
        self.float(name).ok_or_else(|| self.violation(kind, name))
    }
}

/// Field access by name, used by projections.
pub trait Record {
    /// `None` when the record kind has no such field; `Some(Scalar::Null)`
    /// when it has the field but no value.
    fn field(&self, name: &str) -> Option<Scalar>;
}

/// A typed record kind with a declared raw schema.
pub trait SourceRecord: Record + Sized {
    const KIND: RecordKind;

    fn schema() -> &'static DeclaredSchema;

    fn from_normalized(record: &NormalizedRecord) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongRecord {
    pub artist_id: String,
    pub artist_name: String,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
    pub song_id: String,
    pub title: String,
    pub duration: f64,
    pub year: i64,
    pub num_songs: Option<i64>,
}

impl Record for SongRecord {
    fn field(&self, name: &str) -> Option<Scalar> {
        let value: Scalar = match name {
            "artist_id" => self.artist_id.clone().into(),
            "artist_name" => self.artist_name.clone().into(),
            "artist_location" => self.artist_location.clone().into(),
            "artist_latitude" => self.artist_latitude.into(),
            "artist_longitude" => self.artist_longitude.into(),
            "song_id" => self.song_id.clone().into(),
            "title" => self.title.clone().into(),
            "duration" => self.duration.into(),
            "year" => self.year.into(),
            "num_songs" => self.num_songs.into(),
            _ => return None,
        };
        Some(value)
    }
}

impl SourceRecord for SongRecord {
    const KIND: RecordKind = RecordKind::Song;

    fn schema() -> &'static DeclaredSchema {
        declared::song_record()
    }

    fn from_normalized(r: &NormalizedRecord) -> Result<Self> {
        let kind = Self::KIND;
        Ok(Self {
            artist_id: r.required_text(kind, "artist_id")?,
            artist_name: r.required_text(kind, "artist_name")?,
            artist_location: r.text("artist_location"),
            artist_latitude: r.float("artist_latitude"),
            artist_longitude: r.float("artist_longitude"),
            song_id: r.required_text(kind, "song_id")?,
            title: r.required_text(kind, "title")?,
            duration: r.required_float(kind, "duration")?,
            year: r.required_int(kind, "year")?,
            num_songs: r.int("num_songs"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub artist_name: Option<String>,
    pub auth: Option<String>,
    pub user_first_name: Option<String>,
    pub user_last_name: Option<String>,
    pub user_gender: Option<String>,
    pub user_id: Option<String>,
    pub user_level: Option<String>,
    pub item_in_session: Option<i64>,
    pub song_length: Option<f64>,
    pub song_title: Option<String>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub page: Option<String>,
    pub registration: Option<f64>,
    pub session_id: i64,
    pub status: Option<i64>,
    /// Epoch milliseconds.
    pub ts: i64,
    pub user_agent: Option<String>,
}

impl EventRecord {
    pub fn is_page(&self, page: &str) -> bool {
        self.page.as_deref() == Some(page)
    }
}

impl Record for EventRecord {
    fn field(&self, name: &str) -> Option<Scalar> {
        let value: Scalar = match name {
            "artist_name" => self.artist_name.clone().into(),
            "auth" => self.auth.clone().into(),
            "user_first_name" => self.user_first_name.clone().into(),
            "user_last_name" => self.user_last_name.clone().into(),
            "user_gender" => self.user_gender.clone().into(),
            "user_id" => self.user_id.clone().into(),
            "user_level" => self.user_level.clone().into(),
            "item_in_session" => self.item_in_session.into(),
            "song_length" => self.song_length.into(),
            "song_title" => self.song_title.clone().into(),
            "location" => self.location.clone().into(),
            "method" => self.method.clone().into(),
            "page" => self.page.clone().into(),
            "registration" => self.registration.into(),
            "session_id" => self.session_id.into(),
            "status" => self.status.into(),
            "ts" => self.ts.into(),
            "user_agent" => self.user_agent.clone().into(),
            _ => return None,
        };
        Some(value)
    }
}

impl SourceRecord for EventRecord {
    const KIND: RecordKind = RecordKind::Event;

    fn schema() -> &'static DeclaredSchema {
        declared::event_record()
    }

    fn from_normalized(r: &NormalizedRecord) -> Result<Self> {
        let kind = Self::KIND;
        Ok(Self {
            artist_name: r.text("artist_name"),
            auth: r.text("auth"),
            user_first_name: r.text("user_first_name"),
            user_last_name: r.text("user_last_name"),
            user_gender: r.text("user_gender"),
            user_id: r.text("user_id"),
            user_level: r.text("user_level"),
            item_in_session: r.int("item_in_session"),
            song_length: r.float("song_length"),
            song_title: r.text("song_title"),
            location: r.text("location"),
            method: r.text("method"),
            page: r.text("page"),
            registration: r.float("registration"),
            session_id: r.required_int(kind, "session_id")?,
            status: r.int("status"),
            ts: r.required_int(kind, "ts")?,
            user_agent: r.text("user_agent"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, Scalar)]) -> NormalizedRecord {
        NormalizedRecord {
            entry: "song_data/A/A/A/TRAAAAW128F429D538.json".to_string(),
            line: None,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_song_record_from_normalized() {
        let r = record(&[
            ("artist_id", "AR1".into()),
            ("artist_name", "Casual".into()),
            ("song_id", "SOAAA1".into()),
            ("title", "X".into()),
            ("duration", Scalar::Float(180.5)),
            ("year", Scalar::Int(2000)),
            ("artist_latitude", Scalar::Null),
        ]);
        let song = SongRecord::from_normalized(&r).unwrap();
        assert_eq!(song.song_id, "SOAAA1");
        assert_eq!(song.artist_latitude, None);
        assert_eq!(song.field("year"), Some(Scalar::Int(2000)));
        assert_eq!(song.field("artist_location"), Some(Scalar::Null));
        assert_eq!(song.field("no_such_field"), None);
    }

    #[test]
    fn test_missing_required_field_is_violation() {
        let r = record(&[("artist_id", "AR1".into()), ("title", "X".into())]);
        match SongRecord::from_normalized(&r) {
            Err(EtlError::SchemaViolation { kind, field, .. }) => {
                assert_eq!(kind, "song");
                assert_eq!(field, "artist_name");
            }
            other => panic!("expected schema violation, got {:?}", other),
        }
    }
}
