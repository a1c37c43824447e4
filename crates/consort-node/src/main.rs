//! consort node
//!
//! Runs one pipeline on this node and prints its final output.
//!
//! ```bash
//! # central node, aggregating two sites
//! consort-node --client-id central --mode remote pipeline.json --run-id run-1 --clients site-a,site-b
//!
//! # a site
//! consort-node --client-id site-a --remote-host central.example.org pipeline.json --run-id run-1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use consort_core::{Mode, PipelineError, PipelineSpec};
use consort_manager::{ManagerConfig, PipelineManager};

#[derive(Parser)]
#[command(name = "consort-node", version, about = "Run a consort pipeline on this node")]
struct Cli {
    /// Pipeline specification (JSON)
    spec: PathBuf,

    /// Run id shared by every node of the run
    #[arg(long)]
    run_id: String,

    /// Participating sites (remote mode)
    #[arg(long, value_delimiter = ',')]
    clients: Vec<String>,

    /// Node configuration (JSON); flags override it
    #[arg(long, env = "CONSORT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CONSORT_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, value_enum, env = "CONSORT_MODE")]
    mode: Option<NodeMode>,

    #[arg(long, env = "CONSORT_OPERATING_DIRECTORY")]
    operating_directory: Option<PathBuf>,

    #[arg(long, env = "CONSORT_BUS_URL")]
    bus_url: Option<String>,

    #[arg(long, env = "CONSORT_DOCKER_URL")]
    docker_url: Option<String>,

    /// File server address (remote mode)
    #[arg(long, env = "CONSORT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Remote file endpoint host (local mode)
    #[arg(long, env = "CONSORT_REMOTE_HOST")]
    remote_host: Option<String>,

    #[arg(long, env = "CONSORT_REMOTE_PORT")]
    remote_port: Option<u16>,

    /// Keep the run's output directory after cleanup
    #[arg(long)]
    preserve_output: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum NodeMode {
    Local,
    Remote,
}

impl From<NodeMode> for Mode {
    fn from(mode: NodeMode) -> Self {
        match mode {
            NodeMode::Local => Self::Local,
            NodeMode::Remote => Self::Remote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "Starting consort node v{} as {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.client_id,
        config.mode
    );

    let spec: PipelineSpec = serde_json::from_str(
        &std::fs::read_to_string(&cli.spec)
            .with_context(|| format!("reading {}", cli.spec.display()))?,
    )
    .context("parsing pipeline specification")?;
    let pipeline_id = spec.id.clone().unwrap_or_default();

    let manager = PipelineManager::create(config).await?;
    if let Some(addr) = manager.transfer_addr() {
        info!("Serving files on http://{addr}/transfer");
    }

    let run = manager
        .start_pipeline(spec, cli.clients.clone(), &cli.run_id)
        .await?;

    let mut states = run.state.resubscribe();
    tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(update) => debug!(
                    step = update.step,
                    iteration = update.iteration,
                    state = ?update.state,
                    waiting_on = ?update.waiting_on,
                    "State update"
                ),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "State updates skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let interrupt = {
        let manager = manager.clone();
        let run_id = cli.run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping run {run_id}");
                if let Err(e) = manager.stop_pipeline(&pipeline_id, &run_id).await {
                    warn!(error = %e, "Could not stop run");
                }
            }
        })
    };
    let outcome = run.result().await;
    interrupt.abort();

    let finished = match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(PipelineError::Stopped) => {
            info!("Run stopped");
            Ok(())
        }
        Err(e) => Err(e).context(format!("run {} failed", cli.run_id)),
    };

    manager.shutdown().await?;
    finished
}

fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config: ManagerConfig = match &cli.config {
        Some(path) => serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .context("parsing node configuration")?,
        None => {
            let client_id = cli
                .client_id
                .clone()
                .context("--client-id or --config is required")?;
            ManagerConfig::new(client_id, Mode::Local)
        }
    };

    if let Some(client_id) = &cli.client_id {
        config.client_id.clone_from(client_id);
    }
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if let Some(dir) = &cli.operating_directory {
        config.operating_directory.clone_from(dir);
    }
    if let Some(url) = &cli.bus_url {
        config.bus_url.clone_from(url);
    }
    if let Some(url) = &cli.docker_url {
        config.docker_url.clone_from(url);
    }
    if let Some(addr) = cli.listen {
        config.listen_addr = addr;
    }
    if let Some(host) = &cli.remote_host {
        config.remote.host.clone_from(host);
    }
    if let Some(port) = cli.remote_port {
        config.remote.port = port;
    }
    config.preserve_output |= cli.preserve_output;

    Ok(config)
}
