pub mod api;
pub mod classifier;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod extractor;
pub mod progress;
pub mod rate_limit;
pub mod relay;
pub mod selector;
