// Re-export the storage traits
pub use crate::storage_traits::{AuditLog, TokenStore};

// Export implementations
mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
