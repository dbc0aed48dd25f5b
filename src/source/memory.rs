use async_trait::async_trait;
use std::collections::BTreeMap;

use super::Source;
use crate::error::{EtlError, Result};

/// In-memory source for tests and fixtures. Entries are listed by prefix.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.to_string(), content.into());
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn list_entries(&self, location: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .keys()
            .filter(|name| name.starts_with(location))
            .cloned()
            .collect())
    }

    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>> {
        self.entries
            .get(entry)
            .cloned()
            .ok_or_else(|| EtlError::source(entry, "no such entry"))
    }
}
