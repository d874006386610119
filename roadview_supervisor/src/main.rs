//! RoadView CLI
//!
//! `roadview run` supervises feeds until Ctrl-C; `roadview worker` is the
//! child-process entry point the supervisor launches for each feed.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use roadview_core::{FeedSource, WorkerExit, WorkerSpec};
use roadview_env::{SysinfoProbe, SystemClock};
use roadview_supervisor::{
    worker_main, FeedSupervisor, ProcessLauncher, SupervisorConfig, ThreadLauncher, TracingSink, WorkerLauncher,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// RoadView traffic feed supervisor
#[derive(Parser, Debug)]
#[command(name = "roadview")]
#[command(about = "Multi-feed vehicle tracking supervisor", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor
    Run(RunArgs),

    /// Run a single feed worker (launched by the supervisor)
    Worker {
        /// Worker spec as JSON
        #[arg(long)]
        spec: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Isolation {
    /// One child process per feed
    Process,
    /// One thread per feed inside the supervisor
    Thread,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Feed to start: a path, `webcam:<n>`, a stream URL or `synthetic[:seed]`
    #[arg(short, long = "feed")]
    feeds: Vec<String>,

    /// Disable the sample feed
    #[arg(long)]
    no_sample: bool,

    /// How workers are isolated
    #[arg(long, value_enum, default_value = "process")]
    isolation: Isolation,

    /// Refuse new feeds at or above this memory usage (percent)
    #[arg(long, default_value = "85")]
    memory_limit: f32,

    /// Grace period before a stopping worker is killed (seconds)
    #[arg(long, default_value = "3")]
    stop_grace: f64,

    /// Interval between KPI reports (seconds)
    #[arg(long, default_value = "1")]
    kpi_interval: f64,

    /// Lanes per frame
    #[arg(long, default_value = "3")]
    lanes: u32,

    /// Speed limit (km/h)
    #[arg(long, default_value = "60")]
    speed_limit: f64,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout carries worker events, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Worker { spec } => run_worker(&spec),
        Command::Run(run) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(run_supervisor(run))
        }
    }
}

fn run_worker(spec: &str) -> anyhow::Result<()> {
    let spec: WorkerSpec = serde_json::from_str(spec).context("parsing worker spec")?;
    let feed_id = spec.feed_id.clone();
    match worker_main(spec)? {
        WorkerExit::Failed(reason) => anyhow::bail!("worker {} failed: {}", feed_id, reason),
        _ => Ok(()),
    }
}

async fn run_supervisor(args: RunArgs) -> anyhow::Result<()> {
    let mut config = SupervisorConfig {
        memory_limit_percent: args.memory_limit,
        stop_grace_period: Duration::from_secs_f64(args.stop_grace.max(0.0)),
        kpi_interval: Duration::from_secs_f64(args.kpi_interval.max(0.1)),
        ..SupervisorConfig::default()
    };
    if args.no_sample {
        config.sample_source = None;
    }
    config.pipeline.tracking.num_lanes = args.lanes.max(1);
    config.pipeline.tracking.speed_limit_kmh = args.speed_limit;

    let launcher: Arc<dyn WorkerLauncher> = match args.isolation {
        Isolation::Process => Arc::new(ProcessLauncher::current_exe()?),
        Isolation::Thread => Arc::new(ThreadLauncher::new(Arc::new(SystemClock::new()))),
    };

    info!("RoadView supervisor v{}", env!("CARGO_PKG_VERSION"));
    let supervisor = FeedSupervisor::new(config, launcher, Arc::new(SysinfoProbe::new()), Arc::new(TracingSink));
    let reader = supervisor.spawn_reader();

    supervisor.apply_sample_policy().await;
    for (i, feed) in args.feeds.iter().enumerate() {
        let source: FeedSource = match feed.parse() {
            Ok(source) => source,
            Err(e) => {
                error!("Skipping feed {:?}: {}", feed, e);
                continue;
            }
        };
        match supervisor.add_and_start(source, &format!("feed{}", i + 1)).await {
            Ok(id) => info!("Started {} from {}", id, feed),
            Err(e) => warn!("Feed {} not started: {}", feed, e),
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received");
    supervisor.shutdown().await;
    reader.await.context("joining result reader")?;

    for feed in supervisor.feeds() {
        info!(
            "{}: {} ({} frames){}",
            feed.feed_id,
            feed.status,
            feed.frames_received,
            feed.message.map(|m| format!(" - {m}")).unwrap_or_default()
        );
    }
    Ok(())
}
