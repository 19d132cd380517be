pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod prompt;
pub mod proxy;
pub mod rate_limit;
pub mod scoring;
pub mod sse;
pub mod state;
pub mod upstream;
pub mod validation;

pub use handlers::router;
