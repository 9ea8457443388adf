//! Vigil: stream analysis and recording

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil::analysis::PassThrough;
use vigil::{utils, Config, StreamProcessor};

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Analyze a video stream and record the annotated result")]
struct Args {
    /// Path, URL or image directory to read frames from
    source: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not persist processed frames
    #[arg(long)]
    no_save: bool,

    /// Number of frame processor threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory for recordings
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    info!("Vigil launching...");

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if args.no_save {
        config.output.save_result = false;
    }
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if let Some(dir) = args.output_dir {
        config.output.output_dir = dir;
    }
    config.validate()?;

    let connector = utils::select_connector(&args.source, &config.capture)?;
    let mut processor = StreamProcessor::builder(args.source.clone())
        .config(config)
        .boxed_connector(connector)
        .analyzer(Arc::new(PassThrough))
        .sink(utils::default_sink())
        .build();
    processor.start()?;

    let processor = Arc::new(processor);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested by user");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !processor.is_running() {
                    break;
                }
            }
        }
    }

    let stopping = processor.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    match processor.stop_reason() {
        Some(reason) => info!(?reason, frames = processor.frame_count(), "Vigil shutting down"),
        None => warn!("Vigil shutting down without a recorded stop reason"),
    }
    Ok(())
}
