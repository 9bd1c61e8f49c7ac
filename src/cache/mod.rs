//! Caches: open table handles and decoded blocks.

mod block_cache;
mod lru;
mod table_cache;

pub use block_cache::BlockCache;
pub use lru::LruCache;
pub use table_cache::TableCache;
