//! matchgridd — the matchgrid negotiator daemon.
//!
//! Reads machine, submitter and job ads from a directory, runs negotiation
//! cycles, and keeps accounting state in a redb file between runs.
//!
//! # Usage
//!
//! ```text
//! matchgridd run --config matchgrid.toml --ads /var/lib/matchgrid/ads --state /var/lib/matchgrid/state.redb
//! matchgridd once --ads ./ads
//! matchgridd eval --expr 'TARGET.Memory >= 1024' --target machine.ad
//! matchgridd analyze --job job.ad --machines machines.ads
//! ```

mod ads;
mod analyze;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matchgrid_classad::Record;
use matchgrid_negotiator::{Matchmaker, MonotonicClock, NegotiatorConfig};
use matchgrid_state::StateStore;

use crate::ads::{FileQueue, FileSource};

const DEFAULT_LOG_FILTER: &str = "info,matchgrid=debug";

#[derive(Parser)]
#[command(name = "matchgridd", about = "matchgrid negotiator daemon")]
struct Cli {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Negotiate every `cycle_interval_secs` until Ctrl-C.
    Run(CycleArgs),

    /// Negotiate once and print the cycle report as JSON.
    Once(CycleArgs),

    /// Evaluate an expression and print its value.
    Eval {
        /// Expression text.
        #[arg(long)]
        expr: String,

        /// Ad bound to `MY` (defaults to an empty record).
        #[arg(long)]
        my: Option<PathBuf>,

        /// Ad bound to `TARGET`.
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Report for each machine whether it matches a job, and why not.
    Analyze {
        #[arg(long)]
        job: PathBuf,

        /// Long-form file of machine ads.
        #[arg(long)]
        machines: PathBuf,
    },
}

#[derive(Args)]
struct CycleArgs {
    /// Negotiator configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding machines.ads, submitters.ads and jobs/.
    #[arg(long)]
    ads: PathBuf,

    /// Accounting state file. Usage is not remembered between runs
    /// without one.
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run(args) => run(&args).await,
        Command::Once(args) => once(&args).await,
        Command::Eval { expr, my, target } => {
            let my = match my {
                Some(path) => ads::read_ad(&path)?,
                None => Record::new(),
            };
            let target = target.as_deref().map(ads::read_ad).transpose()?;
            let value = analyze::eval_text(&expr, &my, target.as_ref())
                .with_context(|| format!("failed to parse expression {expr:?}"))?;
            println!("{value}");
            Ok(())
        }
        Command::Analyze { job, machines } => {
            let job = ads::read_ad(&job)?;
            let machines = ads::read_ads(&machines)
                .with_context(|| format!("failed to read {}", machines.display()))?;
            print!("{}", analyze::render(&analyze::analyze(&job, &machines)));
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NegotiatorConfig> {
    match path {
        Some(path) => NegotiatorConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(NegotiatorConfig::default().validated()?),
    }
}

fn build_matchmaker(args: &CycleArgs) -> anyhow::Result<Matchmaker> {
    let config = load_config(args.config.as_deref())?;
    let matchmaker = Matchmaker::new(
        config,
        Arc::new(FileSource::new(&args.ads)),
        Arc::new(FileQueue::new(&args.ads)),
        Arc::new(MonotonicClock::new()),
    );
    match &args.state {
        Some(path) => {
            let store = StateStore::open(path)
                .with_context(|| format!("failed to open state {}", path.display()))?;
            info!(path = %path.display(), "accounting state opened");
            Ok(matchmaker
                .with_store(store)
                .context("failed to load accounting state")?)
        }
        None => Ok(matchmaker),
    }
}

async fn run(args: &CycleArgs) -> anyhow::Result<()> {
    let mut matchmaker = build_matchmaker(args)?;
    info!(
        ads = %args.ads.display(),
        interval_secs = matchmaker.config().cycle_interval_secs,
        "matchgridd starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        } else {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    matchmaker.run(shutdown_rx).await;
    info!("matchgridd stopped");
    Ok(())
}

async fn once(args: &CycleArgs) -> anyhow::Result<()> {
    let mut matchmaker = build_matchmaker(args)?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = matchmaker
        .run_cycle(&shutdown_rx)
        .await
        .context("negotiation cycle failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
