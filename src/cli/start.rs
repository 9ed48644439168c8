use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crate::backend::Backends;
use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::{BackendOptions, Opts, PipelineOptions};
use crate::pipeline::{Pipeline, PipelineConfig};

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Search query describing the object class to bootstrap
    pub query: String,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    #[command(flatten)]
    pub backend: BackendOptions,
    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for StartCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let pipeline = Pipeline::open(
            opts.data_dir.clone(),
            Backends::from_options(&self.backend),
            PipelineConfig::from(&self.pipeline),
        )
        .await?;

        let session = pipeline.start(&self.query).await?;
        let images = pipeline.sampled_images(&session.id).await?;

        match self.output_format {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "session": session,
                        "images": images,
                    }))?
                );
            }
            OutputFormat::Table => {
                println!("session\t{}", session.id);
                println!("stage\t{}", session.stage);
                for image in &images {
                    println!("image\t{}\t{}", image.id, image.local_path.display());
                }
            }
        }

        terminal_result(&session)
    }
}

/// Turn a failed session into the process exit code its reason maps to.
pub(crate) fn terminal_result(session: &crate::session::SessionState) -> Result<()> {
    match session.failure_reason {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}
