use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use crate::backend::Backends;
use crate::cli::SubCommandExtend;
use crate::config::{BackendOptions, Opts, PipelineOptions};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::server;

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    #[command(flatten)]
    pub backend: BackendOptions,
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let pipeline = Pipeline::open(
            opts.data_dir.clone(),
            Backends::from_options(&self.backend),
            PipelineConfig::from(&self.pipeline),
        )
        .await?;

        let state = server::AppState::new(pipeline);
        let app = server::create_app(state);

        info!("starting server at http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
