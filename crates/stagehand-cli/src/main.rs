//! stagehand CLI
//!
//! Runs skopeo image operations locally, over SSH, or inside a container

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::eyre;
use stagehand_exec::ExecutorBearer;
use stagehand_skopeo::{DEFAULT_REGISTRY, SkopeoCommands, SkopeoExecutor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{BackendConfig, Config};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Run skopeo image operations on a local, remote or container backend", long_about = None)]
struct Cli {
    /// Config file (default: $STAGEHAND_CONFIG, ./stagehand.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an image to one or more destinations
    Tag {
        /// Source image reference
        #[arg(short, long)]
        source: String,
        /// Destination image references, copied in order
        #[arg(short, long = "dest", required = true)]
        dests: Vec<String>,
        /// Copy every architecture of a multi-arch image
        #[arg(long)]
        all_arch: bool,
    },
    /// Log in to a container registry
    Login {
        /// Registry host
        #[arg(short, long, default_value = DEFAULT_REGISTRY)]
        registry: String,
        /// Registry username
        #[arg(short, long)]
        username: String,
        /// Registry password
        #[arg(long, env = "STAGEHAND_REGISTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Inspect an image and print the result as JSON
    Inspect {
        /// Image reference
        image: String,
        /// Print skopeo's output unparsed
        #[arg(long)]
        raw: bool,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where supported
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn run_command<B: ExecutorBearer>(skopeo: &SkopeoCommands<'_, B>, command: Commands) -> Result<()> {
    match command {
        Commands::Tag {
            source,
            dests,
            all_arch,
        } => {
            skopeo.tag_images(&source, dests.as_slice(), all_arch).await?;
        }
        Commands::Login {
            registry,
            username,
            password,
        } => {
            skopeo
                .login(&registry, Some(&username), password.as_deref())
                .await?;
        }
        Commands::Inspect { image, raw: true } => {
            println!("{}", skopeo.inspect_raw(&image).await?);
        }
        Commands::Inspect { image, raw: false } => {
            let inspection = skopeo.inspect(&image).await?;
            println!("{}", serde_json::to_string_pretty(&inspection)?);
        }
    }
    Ok(())
}

async fn execute<B: ExecutorBearer>(mut executor: SkopeoExecutor<B>, command: Commands) -> Result<()> {
    // A signal ends the body early so the scope still releases the bearer
    executor
        .scope(async move |skopeo: SkopeoCommands<'_, B>| -> Result<()> {
            tokio::select! {
                result = run_command(&skopeo, command) => result,
                () = shutdown_signal() => Err(eyre!("interrupted")),
            }
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let path = Config::locate(cli.config.as_deref());
    let config = match &path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_tracing(&config);

    match &path {
        Some(path) => info!(path = %path.display(), "loaded config"),
        None => warn!("no config file found, using defaults"),
    }

    let retry = config.retry.clone();
    match config.backend {
        BackendConfig::Local(options) => {
            info!("using local backend");
            execute(SkopeoExecutor::local(options).with_retry(retry), cli.command).await
        }
        BackendConfig::Remote(remote) => {
            info!(host = %remote.hostname, "using remote backend");
            execute(SkopeoExecutor::remote(remote)?.with_retry(retry), cli.command).await
        }
        BackendConfig::Container(container) => {
            info!(image = %container.image, "using container backend");
            execute(SkopeoExecutor::container(&container)?.with_retry(retry), cli.command).await
        }
    }
}
