pub mod feed;
pub mod indexer;
pub mod verify;

pub use feed::{lag_between, ChangeFeed, MemoryStore};
pub use indexer::{IndexerState, ViewIndexer};
pub use verify::{verify_and_repair, VerifyOutcome};
