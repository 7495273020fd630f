pub mod config;
pub mod error;
pub mod redis_pool;
pub mod telemetry;
pub mod types;
