//! Source port: "list entries under a location" + "read one entry".
//!
//! The core never cares whether a location is a directory, an object-store
//! prefix or a staged table; it only needs these two capabilities.

pub mod fs;
pub mod memory;

pub use fs::FsSource;
pub use memory::MemorySource;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Source: Send + Sync {
    /// Entries under `location`, in a stable order.
    async fn list_entries(&self, location: &str) -> Result<Vec<String>>;

    /// Raw bytes of one entry returned by `list_entries`.
    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>>;
}
