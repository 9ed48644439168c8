pub mod annotation;
pub mod backend;
pub mod cli;
pub mod config;
pub mod dataset;
mod db;
mod metrics;
pub mod pipeline;
pub mod sampler;
mod server;
pub mod session;
mod utils;

pub use backend::Backends;
pub use config::Opts;
pub use pipeline::{Pipeline, PipelineConfig};
