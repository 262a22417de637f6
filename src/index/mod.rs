pub mod store;
pub mod tree;

pub use store::{DocUpdate, IndexStore, KeyRange, ReducePage, ScanOptions, ScanPage, ViewSnapshot};
pub use tree::{group_key, Cut, EntryKey, IndexEntry, RangeIter, ReduceTree};
