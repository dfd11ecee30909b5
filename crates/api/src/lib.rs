pub mod config;
pub mod http;
pub mod identity_cache;
pub mod lifecycle;
pub mod metrics;
pub mod resolver;
