pub mod backend;
pub mod config;
pub mod context;
pub mod http;
pub mod metrics;
pub mod store;
pub mod workflow;
