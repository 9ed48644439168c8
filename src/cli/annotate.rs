use std::io::Read;

use anyhow::{Context, Result};
use clap::Parser;

use crate::annotation::{Annotation, ManualAnnotation};
use crate::backend::Backends;
use crate::cli::start::terminal_result;
use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::{BackendOptions, Opts, PipelineOptions};
use crate::pipeline::{Pipeline, PipelineConfig};

#[derive(Parser, Debug, Clone)]
pub struct AnnotateCommand {
    /// Session id returned by `start`
    pub session: String,
    /// JSON file with the manual annotations, `-` reads stdin.
    /// Format: `[{"image_id": "...", "class_name": "...",
    /// "bbox": [y_min, x_min, y_max, x_max]}, ...]`
    #[arg(default_value = "-", verbatim_doc_comment)]
    pub file: String,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    #[command(flatten)]
    pub backend: BackendOptions,
    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for AnnotateCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let annotations = read_submission(&self.file)?;

        let pipeline = Pipeline::open(
            opts.data_dir.clone(),
            Backends::from_options(&self.backend),
            PipelineConfig::from(&self.pipeline),
        )
        .await?;

        let session = pipeline.submit_annotations(&self.session, annotations).await?;

        match self.output_format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            OutputFormat::Table => {
                println!("session\t{}", session.id);
                println!("stage\t{}", session.stage);
                if let Some(path) = &session.model_path {
                    println!("model\t{}", path.display());
                }
            }
        }

        terminal_result(&session)
    }
}

fn read_submission(file: &str) -> Result<Vec<Annotation>> {
    let data = if file == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("failed to read stdin")?;
        buf
    } else {
        std::fs::read(file).with_context(|| format!("failed to read {file}"))?
    };

    let items: Vec<ManualAnnotation> =
        serde_json::from_slice(&data).context("malformed annotation submission")?;
    items
        .into_iter()
        .map(|item| {
            let image_id = item.image_id.clone();
            item.into_annotation().with_context(|| format!("annotation for {image_id}"))
        })
        .collect()
}
