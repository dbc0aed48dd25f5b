use async_trait::async_trait;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use super::Source;
use crate::constants::SOURCE_FILE_EXTENSION;
use crate::error::{EtlError, Result};

/// Local filesystem source. A location is a file or a directory walked
/// recursively for `*.json` files.
#[derive(Debug, Default, Clone)]
pub struct FsSource;

impl FsSource {
    pub fn new() -> Self {
        Self
    }
}

fn is_source_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SOURCE_FILE_EXTENSION)
}

#[async_trait]
impl Source for FsSource {
    async fn list_entries(&self, location: &str) -> Result<Vec<String>> {
        let root = Path::new(location);
        if !root.exists() {
            return Err(EtlError::source(location, "path does not exist"));
        }
        if root.is_file() {
            return Ok(vec![location.to_string()]);
        }

        let mut entries = Vec::new();
        for item in WalkDir::new(root).follow_links(true) {
            let item = item.map_err(|e| EtlError::source(location, e))?;
            if item.file_type().is_file() && is_source_file(item.path()) {
                entries.push(item.path().to_string_lossy().to_string());
            }
        }
        entries.sort();
        debug!("Listed {} entries under {}", entries.len(), location);
        Ok(entries)
    }

    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>> {
        tokio::fs::read(entry)
            .await
            .map_err(|e| EtlError::source(entry, e))
    }
}
