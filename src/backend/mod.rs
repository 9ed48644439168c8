mod command;
mod embed;
mod fetch;
mod search;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::annotation::BBox;
use crate::config::BackendOptions;
use crate::dataset::DatasetDescriptor;

pub use command::{CommandDetector, CommandExporter};
pub use embed::HistogramExtractor;
pub use fetch::FileFetcher;
pub use search::GoogleSearcher;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("missing search credentials (api key / engine id)")]
    MissingCredentials,
    #[error("search request failed: {0}")]
    Request(String),
    #[error("search provider returned HTTP {0}")]
    Status(u16),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http client: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("unreadable image: {path}")]
    Unreadable { path: PathBuf },
    #[error("io error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector not configured: {0}")]
    NotConfigured(&'static str),
    #[error("training failed: {0}")]
    Train(String),
    #[error("inference failed: {0}")]
    Infer(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("exporter not configured")]
    NotConfigured,
    #[error("export failed: {0}")]
    Failed(String),
}

/// Reference to a trained model artifact.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub path: PathBuf,
}

/// Extra inputs to one training call.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Where the trained model lands.
    pub output_dir: PathBuf,
    /// Path of the written dataset descriptor file.
    pub dataset_file: PathBuf,
}

/// One detection reported by the detector, before threshold filtering.
#[derive(Debug, Clone)]
pub struct Detection {
    pub class_name: String,
    pub bbox: BBox,
    pub score: f32,
}

/// Image search provider. A provider error must surface as `SearchError`,
/// never as an ambiguous empty list; an empty `Ok` means genuinely zero
/// results.
pub trait Searcher: Send + Sync {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, SearchError>;
}

/// Batch image acquisition. Per-URL failures are skipped and logged inside
/// the implementation; the caller gets back pairs only for URLs that
/// yielded a new local file (duplicate content is skipped too).
pub trait Fetcher: Send + Sync {
    fn fetch_all(&self, urls: &[String], dest: &Path)
        -> Result<Vec<(String, PathBuf)>, FetchError>;
}

/// Maps an image file to a fixed-length embedding vector.
pub trait FeatureExtractor: Send + Sync {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError>;
}

/// Trainable, inferable object detector.
pub trait Detector: Send + Sync {
    fn train(
        &self,
        dataset: &DatasetDescriptor,
        config: &TrainConfig,
    ) -> Result<ModelHandle, DetectorError>;

    fn infer(&self, model: &ModelHandle, image: &Path) -> Result<Vec<Detection>, DetectorError>;
}

/// Model export / format conversion.
pub trait Exporter: Send + Sync {
    fn export(&self, model: &ModelHandle, dest: &Path) -> Result<PathBuf, ExportError>;
}

/// The swappable collaborators of one pipeline. The orchestrator and the
/// sampler only ever see these traits.
#[derive(Clone)]
pub struct Backends {
    pub searcher: Arc<dyn Searcher>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub detector: Arc<dyn Detector>,
    pub exporter: Arc<dyn Exporter>,
}

impl Backends {
    /// Assemble the default adapters from CLI options and environment.
    pub fn from_options(opts: &BackendOptions) -> Self {
        Self {
            searcher: Arc::new(GoogleSearcher::new(
                opts.api_key.clone().or_else(|| std::env::var("GOOGLE_API_KEY").ok()),
                opts.engine_id.clone().or_else(|| std::env::var("GOOGLE_SEARCH_CX").ok()),
            )),
            fetcher: Arc::new(FileFetcher::new(Duration::from_secs(opts.fetch_timeout))),
            extractor: Arc::new(HistogramExtractor::default()),
            detector: Arc::new(CommandDetector::new(
                opts.train_cmd.as_deref(),
                opts.infer_cmd.as_deref(),
            )),
            exporter: Arc::new(CommandExporter::new(opts.export_cmd.as_deref())),
        }
    }
}
