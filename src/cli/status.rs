use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::Opts;
use crate::db::{self, crud};

#[derive(Parser, Debug, Clone)]
pub struct StatusCommand {
    /// Session id returned by `start`
    pub session: String,
    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for StatusCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        std::fs::create_dir_all(opts.data_dir.path())?;
        let db = db::init_db(opts.data_dir.database()).await?;
        let session = crud::get_session(&db, &self.session)
            .await?
            .with_context(|| format!("no such session: {}", self.session))?;

        match self.output_format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            OutputFormat::Table => {
                println!("session\t{}", session.id);
                println!("query\t{}", session.query);
                println!("stage\t{}", session.stage);
                if let Some(reason) = session.failure_reason {
                    println!("reason\t{reason}");
                }
                if let Some(path) = &session.model_path {
                    println!("model\t{}", path.display());
                }
                println!("updated\t{}", session.updated_at.to_rfc3339());
            }
        }
        Ok(())
    }
}
