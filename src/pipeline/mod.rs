// ETL stages: normalize, build dimensions, resolve facts, load

pub mod dimension;
pub mod load;
pub mod normalize;
pub mod orchestrator;
pub mod resolve;

// Re-export the entry points of each stage
pub use dimension::{build_default, build_dimension, Dimension, DimensionBatch, Projection};
pub use load::{dedupe_by_key, merge_anti_join, overwrite_partitions, LoadReport, LoadStrategy};
pub use normalize::{
    read_records, NormalizeStats, Normalized, NormalizedBatch, ParseFailure, RecordStream,
};
pub use orchestrator::{Orchestrator, RunInput, RunReport, Target};
pub use resolve::{build_song_plays, FactBatch, FactResolver, Resolution, ResolveStats};
