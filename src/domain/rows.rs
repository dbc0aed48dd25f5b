use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::schema::Row;

/// A typed star-table row that can be flattened into declared column order.
pub trait TableRow {
    fn to_row(&self) -> Row;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Song {
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub year: i64,
    pub duration: f64,
}

impl TableRow for Song {
    fn to_row(&self) -> Row {
        Row::new(vec![
            self.song_id.as_str().into(),
            self.title.as_str().into(),
            self.artist_id.as_str().into(),
            self.year.into(),
            self.duration.into(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artist {
    pub artist_id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TableRow for Artist {
    fn to_row(&self) -> Row {
        Row::new(vec![
            self.artist_id.as_str().into(),
            self.name.clone().into(),
            self.location.clone().into(),
            self.latitude.into(),
            self.longitude.into(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub user_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
}

impl TableRow for User {
    fn to_row(&self) -> Row {
        Row::new(vec![
            self.user_id.as_str().into(),
            self.first_name.clone().into(),
            self.last_name.clone().into(),
            self.gender.clone().into(),
            self.level.clone().into(),
        ])
    }
}

/// Calendar breakdown of a play's start time. Timezone-naive: epoch millis
/// map directly onto UTC wall-clock fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TimePart {
    pub start_time: NaiveDateTime,
    pub hour: i64,
    pub day: i64,
    /// ISO-8601 week of year.
    pub week: i64,
    pub month: i64,
    pub year: i64,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: i64,
}

impl TimePart {
    pub fn from_start_time(start_time: NaiveDateTime) -> Self {
        Self {
            start_time,
            hour: start_time.hour() as i64,
            day: start_time.day() as i64,
            week: start_time.iso_week().week() as i64,
            month: start_time.month() as i64,
            year: start_time.year() as i64,
            weekday: start_time.weekday().num_days_from_sunday() as i64,
        }
    }
}

impl TableRow for TimePart {
    fn to_row(&self) -> Row {
        Row::new(vec![
            self.start_time.into(),
            self.hour.into(),
            self.day.into(),
            self.week.into(),
            self.month.into(),
            self.year.into(),
            self.weekday.into(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongPlay {
    pub start_time: NaiveDateTime,
    pub user_id: String,
    pub level: Option<String>,
    pub song_id: Option<String>,
    pub artist_id: Option<String>,
    pub session_id: i64,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

impl TableRow for SongPlay {
    fn to_row(&self) -> Row {
        Row::new(vec![
            self.start_time.into(),
            self.user_id.as_str().into(),
            self.level.clone().into(),
            self.song_id.clone().into(),
            self.artist_id.clone().into(),
            self.session_id.into(),
            self.location.clone().into(),
            self.user_agent.clone().into(),
        ])
    }
}

/// `ts / 1000` whole seconds since the epoch, as a naive UTC timestamp.
///
/// Sub-second precision is dropped so that the fact table and the time
/// dimension agree on `start_time`.
pub fn start_time_from_millis(ts: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(ts.div_euclid(1000), 0).map(|dt| dt.naive_utc())
}

pub fn to_rows<'a, T: TableRow + 'a>(items: impl IntoIterator<Item = &'a T>) -> Vec<Row> {
    items.into_iter().map(|item| item.to_row()).collect()
}
