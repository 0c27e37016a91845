//! Per-key result cache and status registry

mod cache;
mod status;

pub use cache::{CacheEntry, CacheStore};
pub use status::StatusRegistry;
