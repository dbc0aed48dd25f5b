//! Fact resolver: NextSong events -> songplay rows.
//!
//! Resolution is a best-effort title lookup against the song dimension. Exact,
//! case-sensitive title equality is the only mandatory predicate; duration and
//! artist-name cross-checks tighten it when enabled. An event with no single
//! match still produces a fact row, with null song and artist ids.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

use crate::config::{MatchPolicy, ResolverConfig};
use crate::constants::NEXT_SONG_PAGE;
use crate::domain::{start_time_from_millis, Artist, EventRecord, Song, SongPlay};
use crate::metrics::{self, MetricName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched {
        song_id: String,
        artist_id: String,
        /// How many songs passed every predicate; more than one only under
        /// [`MatchPolicy::FirstMatch`].
        candidates: usize,
    },
    Unmatched,
    Ambiguous {
        candidates: usize,
    },
}

impl Resolution {
    pub fn ids(&self) -> (Option<String>, Option<String>) {
        match self {
            Resolution::Matched {
                song_id, artist_id, ..
            } => (Some(song_id.clone()), Some(artist_id.clone())),
            _ => (None, None),
        }
    }
}

pub struct FactResolver<'a> {
    by_title: HashMap<&'a str, Vec<&'a Song>>,
    artist_names: HashMap<&'a str, Option<&'a str>>,
    config: &'a ResolverConfig,
}

impl<'a> FactResolver<'a> {
    pub fn new(songs: &'a [Song], artists: &'a [Artist], config: &'a ResolverConfig) -> Self {
        let mut by_title: HashMap<&str, Vec<&Song>> = HashMap::new();
        for song in songs {
            by_title.entry(song.title.as_str()).or_default().push(song);
        }
        let mut artist_names = HashMap::new();
        for artist in artists {
            artist_names
                .entry(artist.artist_id.as_str())
                .or_insert(artist.name.as_deref());
        }
        Self {
            by_title,
            artist_names,
            config,
        }
    }

    pub fn resolve(&self, event: &EventRecord) -> Resolution {
        let Some(title) = event.song_title.as_deref() else {
            return Resolution::Unmatched;
        };
        // Catalog rows repeating one (song_id, artist_id) are a single candidate
        let mut seen = HashSet::new();
        let candidates: Vec<&Song> = self
            .by_title
            .get(title)
            .map(|songs| {
                songs
                    .iter()
                    .copied()
                    .filter(|song| self.duration_agrees(song, event))
                    .filter(|song| self.artist_agrees(song, event))
                    .filter(|&song| seen.insert((song.song_id.as_str(), song.artist_id.as_str())))
                    .collect()
            })
            .unwrap_or_default();

        match (candidates.as_slice(), self.config.policy) {
            ([], _) => Resolution::Unmatched,
            ([song], _) => Resolution::Matched {
                song_id: song.song_id.clone(),
                artist_id: song.artist_id.clone(),
                candidates: 1,
            },
            ([first, ..], MatchPolicy::FirstMatch) => Resolution::Matched {
                song_id: first.song_id.clone(),
                artist_id: first.artist_id.clone(),
                candidates: candidates.len(),
            },
            (_, MatchPolicy::Strict) => Resolution::Ambiguous {
                candidates: candidates.len(),
            },
        }
    }

    fn duration_agrees(&self, song: &Song, event: &EventRecord) -> bool {
        if !self.config.match_duration {
            return true;
        }
        event
            .song_length
            .map(|length| (song.duration - length).abs() <= self.config.duration_tolerance)
            .unwrap_or(false)
    }

    fn artist_agrees(&self, song: &Song, event: &EventRecord) -> bool {
        if !self.config.match_artist_name {
            return true;
        }
        match (
            self.artist_names.get(song.artist_id.as_str()).copied().flatten(),
            event.artist_name.as_deref(),
        ) {
            (Some(known), Some(claimed)) => known == claimed,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    pub events: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    /// NextSong events without a user id or with an unrepresentable `ts`;
    /// they cannot form a fact key.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct FactBatch {
    pub rows: Vec<SongPlay>,
    pub stats: ResolveStats,
}

/// One songplay row per qualifying NextSong event.
#[instrument(skip_all, fields(events = events.len(), songs = songs.len()))]
pub fn build_song_plays(
    events: &[EventRecord],
    songs: &[Song],
    artists: &[Artist],
    config: &ResolverConfig,
) -> FactBatch {
    let resolver = FactResolver::new(songs, artists, config);
    let mut stats = ResolveStats::default();
    let mut rows = Vec::new();

    for event in events.iter().filter(|e| e.is_page(NEXT_SONG_PAGE)) {
        stats.events += 1;
        let (Some(user_id), Some(start_time)) =
            (event.user_id.as_ref(), start_time_from_millis(event.ts))
        else {
            stats.skipped += 1;
            warn!(
                session_id = event.session_id,
                ts = event.ts,
                "NextSong event cannot form a songplay key, skipping"
            );
            continue;
        };

        let resolution = resolver.resolve(event);
        match &resolution {
            Resolution::Matched { candidates, .. } => {
                stats.matched += 1;
                if *candidates > 1 {
                    stats.ambiguous += 1;
                    debug!(
                        title = ?event.song_title,
                        candidates,
                        "Several songs share this title, taking the first"
                    );
                }
            }
            Resolution::Unmatched => stats.unmatched += 1,
            Resolution::Ambiguous { candidates } => {
                stats.ambiguous += 1;
                debug!(
                    title = ?event.song_title,
                    candidates,
                    "Ambiguous title, leaving song and artist null"
                );
            }
        }

        let (song_id, artist_id) = resolution.ids();
        rows.push(SongPlay {
            start_time,
            user_id: user_id.clone(),
            level: event.user_level.clone(),
            song_id,
            artist_id,
            session_id: event.session_id,
            location: event.location.clone(),
            user_agent: event.user_agent.clone(),
        });
    }

    info!(
        "Resolved {} NextSong events: {} matched, {} unmatched, {} ambiguous, {} skipped",
        stats.events, stats.matched, stats.unmatched, stats.ambiguous, stats.skipped
    );
    let label = || ("policy", config.policy.as_str().to_string());
    metrics::increment(MetricName::ResolverMatched, label(), stats.matched as u64);
    metrics::increment(MetricName::ResolverUnmatched, label(), stats.unmatched as u64);
    metrics::increment(MetricName::ResolverAmbiguous, label(), stats.ambiguous as u64);

    FactBatch { rows, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(song_id: &str, title: &str, artist_id: &str, duration: f64) -> Song {
        Song {
            song_id: song_id.to_string(),
            title: title.to_string(),
            artist_id: artist_id.to_string(),
            year: 2000,
            duration,
        }
    }

    fn artist(artist_id: &str, name: &str) -> Artist {
        Artist {
            artist_id: artist_id.to_string(),
            name: Some(name.to_string()),
            location: None,
            latitude: None,
            longitude: None,
        }
    }

    fn play(page: &str, title: &str, ts: i64) -> EventRecord {
        EventRecord {
            artist_name: Some("Casual".to_string()),
            auth: None,
            user_first_name: None,
            user_last_name: None,
            user_gender: None,
            user_id: Some("8".to_string()),
            user_level: Some("free".to_string()),
            item_in_session: None,
            song_length: Some(180.4),
            song_title: Some(title.to_string()),
            location: Some("Phoenix, AZ".to_string()),
            method: None,
            page: Some(page.to_string()),
            registration: None,
            session_id: 139,
            status: None,
            ts,
            user_agent: None,
        }
    }

    #[test]
    fn test_single_title_match() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5)];
        let batch = build_song_plays(
            &[play("NextSong", "X", 1_600_000_000_000)],
            &songs,
            &[],
            &ResolverConfig::default(),
        );
        assert_eq!(batch.rows.len(), 1);
        let row = &batch.rows[0];
        assert_eq!(row.start_time.to_string(), "2020-09-13 12:26:40");
        assert_eq!(row.song_id.as_deref(), Some("SOAAA1"));
        assert_eq!(row.artist_id.as_deref(), Some("AR1"));
        assert_eq!(batch.stats.matched, 1);
    }

    #[test]
    fn test_duplicate_title_is_ambiguous_under_strict() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5), song("SOBBB2", "X", "AR2", 200.0)];
        let batch = build_song_plays(
            &[play("NextSong", "X", 1_600_000_000_000)],
            &songs,
            &[],
            &ResolverConfig::default(),
        );
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].song_id, None);
        assert_eq!(batch.rows[0].artist_id, None);
        assert_eq!(batch.stats.ambiguous, 1);
    }

    #[test]
    fn test_first_match_policy_takes_dimension_order() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5), song("SOBBB2", "X", "AR2", 200.0)];
        let config = ResolverConfig {
            policy: MatchPolicy::FirstMatch,
            ..ResolverConfig::default()
        };
        let batch = build_song_plays(&[play("NextSong", "X", 0)], &songs, &[], &config);
        assert_eq!(batch.rows[0].song_id.as_deref(), Some("SOAAA1"));
    }

    #[test]
    fn test_predicates_narrow_candidates() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5), song("SOBBB2", "X", "AR2", 200.0)];
        let artists = vec![artist("AR1", "Casual"), artist("AR2", "Someone Else")];

        let by_duration = ResolverConfig {
            match_duration: true,
            ..ResolverConfig::default()
        };
        let resolver = FactResolver::new(&songs, &artists, &by_duration);
        assert_eq!(
            resolver.resolve(&play("NextSong", "X", 0)),
            Resolution::Matched {
                song_id: "SOAAA1".to_string(),
                artist_id: "AR1".to_string(),
                candidates: 1
            }
        );

        let by_artist = ResolverConfig {
            match_artist_name: true,
            ..ResolverConfig::default()
        };
        let resolver = FactResolver::new(&songs, &artists, &by_artist);
        assert_eq!(resolver.resolve(&play("NextSong", "X", 0)).ids().0.as_deref(), Some("SOAAA1"));
    }

    #[test]
    fn test_non_next_song_events_never_produce_rows() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5)];
        let events = vec![play("Home", "X", 0), play("Logout", "X", 1), play("NextSong", "Y", 2)];
        let batch = build_song_plays(&events, &songs, &[], &ResolverConfig::default());
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].song_id, None);
        assert_eq!(batch.stats.unmatched, 1);
    }

    #[test]
    fn test_title_match_is_case_sensitive() {
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5)];
        let config = ResolverConfig::default();
        let resolver = FactResolver::new(&songs, &[], &config);
        assert_eq!(resolver.resolve(&play("NextSong", "x", 0)), Resolution::Unmatched);
    }

    #[test]
    fn test_repeated_catalog_song_is_one_candidate() {
        // Same song listed twice with slightly different durations
        let songs = vec![song("SOAAA1", "X", "AR1", 180.5), song("SOAAA1", "X", "AR1", 180.6)];
        let batch = build_song_plays(
            &[play("NextSong", "X", 1_600_000_000_000)],
            &songs,
            &[],
            &ResolverConfig::default(),
        );
        assert_eq!(batch.rows[0].song_id.as_deref(), Some("SOAAA1"));
        assert_eq!(batch.rows[0].artist_id.as_deref(), Some("AR1"));
        assert_eq!(batch.stats.matched, 1);
        assert_eq!(batch.stats.ambiguous, 0);
    }
}
