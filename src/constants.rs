/// Default star table names; overridable through the `[tables]` config section
pub const SONGS_TABLE: &str = "songs";
pub const ARTISTS_TABLE: &str = "artists";
pub const USERS_TABLE: &str = "users";
pub const TIME_TABLE: &str = "time";
pub const SONGPLAYS_TABLE: &str = "songplays";

/// Only events on this page describe a song being played
pub const NEXT_SONG_PAGE: &str = "NextSong";

// Configuration discovery
pub const CONFIG_ENV: &str = "SPARKIFY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "sparkify.toml";

// Lake layout
pub const PART_FILE_NAME: &str = "part-00000.jsonl";
pub const MANIFEST_FILE_NAME: &str = "_manifest.json";
pub const SCHEMA_FILE_NAME: &str = "_schema.json";
pub const STAGING_DIR_PREFIX: &str = ".staging-";

/// Source files are selected by this extension
pub const SOURCE_FILE_EXTENSION: &str = "json";
