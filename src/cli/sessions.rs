use anyhow::Result;
use clap::Parser;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::Opts;
use crate::db::{self, crud};

#[derive(Parser, Debug, Clone)]
pub struct SessionsCommand {
    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SessionsCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        std::fs::create_dir_all(opts.data_dir.path())?;
        let db = db::init_db(opts.data_dir.database()).await?;
        let sessions = crud::list_sessions(&db).await?;

        match self.output_format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            }
            OutputFormat::Table => {
                for session in &sessions {
                    println!(
                        "{}\t{}\t{}\t{:?}",
                        session.id, session.stage, session.updated_at.to_rfc3339(), session.query
                    );
                }
            }
        }
        Ok(())
    }
}
