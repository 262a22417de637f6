#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod event;
pub mod index;
pub mod query;
pub mod stats;
pub mod storage;

pub use config::EngineConfig;
pub use event::{ChangeFeed, MemoryStore, ViewIndexer};
pub use query::{QueryEngine, QueryOptions, ViewResult};
