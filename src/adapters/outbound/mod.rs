mod memory_bus;
mod memory_store;
mod sqlite_store;

pub use memory_bus::MemoryBus;
pub use memory_store::MemoryMapStore;
pub use sqlite_store::SqliteMapStore;
