//! Work-queue providers.

mod in_memory;
mod redis;

pub use in_memory::InMemoryWorkQueue;
pub use redis::RedisWorkQueue;
