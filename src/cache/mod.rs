pub mod local_cache;
pub mod redis_cache;
pub mod stats;

pub use local_cache::LocalRecordCache;
pub use redis_cache::{RedisLeaseLock, RedisRecordCache};
pub use stats::CacheStats;
