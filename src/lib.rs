pub mod analyzer;
pub mod backend;
pub mod config;
pub mod demo;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod tokens;
pub mod tracking;
