pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use agentflow_core::config::{StoreBackend, StoreConfig};
use agentflow_core::error::Result;
use agentflow_core::traits::FlowStore;

/// Build the `FlowStore` selected by `[store]` config.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn FlowStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.resolved_path())?)),
    }
}
