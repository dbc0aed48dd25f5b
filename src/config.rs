use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::constants;
use crate::error::{EtlError, Result};

/// Process-wide configuration, loaded once at startup and passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub source: SourceConfig,
    pub tables: TableNames,
    pub target: TargetConfig,
    pub resolver: ResolverConfig,
    pub run: RunConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub song_data: String,
    pub log_data: String,
    /// Small fixed slice substituted on `--dry-run`.
    pub sample_song_data: String,
    pub sample_log_data: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            song_data: "data/song_data".to_string(),
            log_data: "data/log_data".to_string(),
            sample_song_data: "data/song_data/A/A/A".to_string(),
            sample_log_data: "data/log_data/2018/11".to_string(),
        }
    }
}

impl SourceConfig {
    /// (song location, log location) for this run.
    pub fn locations(&self, dry_run: bool) -> (&str, &str) {
        if dry_run {
            (&self.sample_song_data, &self.sample_log_data)
        } else {
            (&self.song_data, &self.log_data)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub songs: String,
    pub artists: String,
    pub users: String,
    pub time: String,
    pub songplays: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            songs: constants::SONGS_TABLE.to_string(),
            artists: constants::ARTISTS_TABLE.to_string(),
            users: constants::USERS_TABLE.to_string(),
            time: constants::TIME_TABLE.to_string(),
            songplays: constants::SONGPLAYS_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Relational store, anti-join merge.
    Sqlite,
    /// Partitioned files, overwrite-by-partition.
    Lake,
}

impl std::str::FromStr for TargetKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(TargetKind::Sqlite),
            "lake" => Ok(TargetKind::Lake),
            other => Err(EtlError::Config(format!(
                "unknown target '{}'; expected one of: sqlite, lake",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub kind: TargetKind,
    pub sqlite_path: PathBuf,
    pub lake_root: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            kind: TargetKind::Sqlite,
            sqlite_path: PathBuf::from("sparkify.db"),
            lake_root: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Zero or several candidate songs resolve to (null, null).
    #[default]
    Strict,
    /// Several candidates resolve to the first one in dimension order.
    FirstMatch,
}

impl MatchPolicy {
    /// Spelling used in config files and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Strict => "strict",
            MatchPolicy::FirstMatch => "first_match",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub policy: MatchPolicy,
    /// Also require |song.duration - event.song_length| <= duration_tolerance.
    pub match_duration: bool,
    /// Also require artist.name == event.artist_name.
    pub match_artist_name: bool,
    pub duration_tolerance: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::Strict,
            match_duration: false,
            match_artist_name: false,
            duration_tolerance: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Abort when unparseable entries exceed this share of all entries.
    pub max_parse_failure_ratio: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parse_failure_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listen address; metrics stay in-process when unset.
    pub addr: Option<String>,
}

impl EtlConfig {
    /// Load from `path`, or from `SPARKIFY_CONFIG`, or from the default file.
    ///
    /// Only the default file may be absent, in which case built-in defaults
    /// apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(constants::CONFIG_ENV).ok().map(PathBuf::from));

        let config_path = match explicit {
            Some(p) => p,
            None => {
                let default_path = PathBuf::from(constants::DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    info!("No {} found, using built-in defaults", constants::DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let config_content = fs::read_to_string(&config_path).map_err(|e| {
            EtlError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path.display(),
                e
            ))
        })?;
        let config = Self::from_toml(&config_content)?;
        info!("Loaded configuration from {}", config_path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EtlConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.run.max_parse_failure_ratio) {
            return Err(EtlError::Config(format!(
                "run.max_parse_failure_ratio must be within [0, 1], got {}",
                self.run.max_parse_failure_ratio
            )));
        }
        if self.resolver.duration_tolerance < 0.0 {
            return Err(EtlError::Config(
                "resolver.duration_tolerance must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EtlConfig::from_toml(
            r#"
            [tables]
            songplays = "fact_songplays"

            [target]
            kind = "lake"
            lake_root = "/tmp/sparkify"

            [resolver]
            policy = "first_match"
            "#,
        )
        .unwrap();

        assert_eq!(config.tables.songplays, "fact_songplays");
        assert_eq!(config.tables.songs, "songs");
        assert_eq!(config.target.kind, TargetKind::Lake);
        assert_eq!(config.resolver.policy, MatchPolicy::FirstMatch);
        assert_eq!(config.resolver.policy.as_str(), "first_match");
        assert!(!config.resolver.match_duration);
        assert_eq!(config.run.max_parse_failure_ratio, 0.05);
    }

    #[test]
    fn test_dry_run_swaps_in_sample_locations() {
        let source = SourceConfig::default();
        assert_eq!(source.locations(true), ("data/song_data/A/A/A", "data/log_data/2018/11"));
        assert_eq!(source.locations(false), ("data/song_data", "data/log_data"));
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let err = EtlConfig::from_toml("[run]\nmax_parse_failure_ratio = 2.0").unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_target_kind_from_str() {
        assert_eq!("Lake".parse::<TargetKind>().unwrap(), TargetKind::Lake);
        assert!("postgres".parse::<TargetKind>().is_err());
    }
}
