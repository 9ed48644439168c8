use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;

use crate::cli::*;

static DATA_DIR: LazyLock<DataDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "", "autolabel").expect("failed to get project dir");
    DataDir { path: proj_dirs.data_dir().to_path_buf() }
});

fn default_data_dir() -> &'static str {
    DATA_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "autolabel", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// Directory holding the session database and per-session workspaces
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// Start a session: search, diversity-sample, wait for manual labels
    Start(StartCommand),
    /// Submit manual annotations and run the session to completion
    Annotate(AnnotateCommand),
    /// Show the current stage of a session
    Status(StatusCommand),
    /// List all sessions
    Sessions(SessionsCommand),
    /// Start the HTTP pipeline service
    Server(ServerCommand),
}

/// Knobs of one pipeline run, shared by the commands that advance a session.
#[derive(Parser, Debug, Clone)]
pub struct PipelineOptions {
    /// Number of images selected for manual annotation
    #[arg(short = 'k', long, value_name = "N", default_value_t = 9)]
    pub sample_count: usize,
    /// Maximum search results fetched as the candidate pool
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub search_results: usize,
    /// Size of the expanded pool labeled by the bootstrap model
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub pool_size: usize,
    /// Auto annotations below this confidence are discarded
    #[arg(long, value_name = "SCORE", default_value_t = 0.5)]
    pub confidence_threshold: f32,
    /// Per-stage timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 600)]
    pub stage_timeout: u64,
}

impl PipelineOptions {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout)
    }
}

/// External collaborator configuration: search credentials and the
/// detector/exporter command lines.
#[derive(Parser, Debug, Clone)]
pub struct BackendOptions {
    /// Google Custom Search API key, falls back to $GOOGLE_API_KEY
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,
    /// Google Custom Search engine id, falls back to $GOOGLE_SEARCH_CX
    #[arg(long, value_name = "ID")]
    pub engine_id: Option<String>,
    /// Detector training command; {dataset} and {model} are substituted
    #[arg(long, value_name = "CMD")]
    pub train_cmd: Option<String>,
    /// Detector inference command; {model} and {image} are substituted,
    /// detections are read from stdout as annotation JSON
    #[arg(long, value_name = "CMD")]
    pub infer_cmd: Option<String>,
    /// Model export command; {model} and {output} are substituted
    #[arg(long, value_name = "CMD")]
    pub export_cmd: Option<String>,
    /// Per-download timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub fetch_timeout: u64,
}

/// All filesystem layout decisions live here: the database file and the
/// per-session workspace subdirectories. Sessions never share a directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Path of the sqlite session database
    pub fn database(&self) -> PathBuf {
        self.path.join("autolabel.db")
    }

    /// Workspace root of one session
    pub fn session(&self, id: &str) -> PathBuf {
        self.path.join("sessions").join(id)
    }

    /// Staging directory for the candidate pool, removed after sampling
    pub fn candidates_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("candidates")
    }

    /// Training images (sampled subset plus the expanded pool)
    pub fn images_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("images")
    }

    /// Per-image annotation JSON files
    pub fn annotations_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("annotations")
    }

    /// Dataset descriptor and label map
    pub fn dataset_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("dataset")
    }

    /// Trained model artifacts
    pub fn model_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("model")
    }

    /// Exported model artifacts
    pub fn export_dir(&self, id: &str) -> PathBuf {
        self.session(id).join("export")
    }

    pub fn create_session_dirs(&self, id: &str) -> io::Result<()> {
        for dir in [
            self.candidates_dir(id),
            self.images_dir(id),
            self.annotations_dir(id),
            self.dataset_dir(id),
            self.model_dir(id),
            self.export_dir(id),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

impl From<PathBuf> for DataDir {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}
