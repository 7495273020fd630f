pub mod circuit_breaker;
pub mod dedup;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod startup;
pub mod transport;
