pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;

// Schema registry and the typed records/rows that flow through the stages
pub mod domain;
pub mod schema;

// Ports: where records come from and where rows go
pub mod source;
pub mod storage;

pub mod pipeline;
