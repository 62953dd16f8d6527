pub mod blocking;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod db;
pub mod eviction;
pub mod frame;
pub mod memory;
pub mod reply_guard;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod shard;
pub mod store;
pub mod transaction;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
