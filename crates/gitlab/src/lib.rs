mod client;
mod error;
pub mod models;

pub use client::{CallObserver, GitLabApi, GitLabClient, GitLabClientConfig, PipelineFilter};
pub use error::GitLabError;
