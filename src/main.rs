mod config;
mod demo;
mod sim;
mod watch;
mod world;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::config::TerrainConfig;
use crate::demo::DemoOptions;

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Headless terrain collision streaming demo", long_about = None)]
struct Cli {
    /// Terrain config file; defaults apply when it does not exist
    #[arg(long, default_value = "strata.toml")]
    config: PathBuf,

    /// World ticks to run before shutting down
    #[arg(long, default_value_t = 600)]
    ticks: u64,

    /// Number of simulated bodies
    #[arg(long, default_value_t = 4)]
    bodies: u32,

    /// Seed for terrain noise and random edits
    #[arg(long, default_value_t = 1337)]
    seed: u64,

    /// Loaded world half-width in cells
    #[arg(long, default_value_t = 8)]
    extent: i32,

    /// Reload scheduler settings when the config file changes
    #[arg(long)]
    watch: bool,

    /// Log filter, e.g. "debug" or "info,sched=trace" (RUST_LOG also works)
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &cli.log {
        logger.parse_filters(filter);
    }
    logger.init();

    let cfg = match TerrainConfig::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("failed to load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "cell size {}, {} bodies, {} ticks",
        cfg.cell.size,
        cli.bodies,
        cli.ticks
    );

    let opts = DemoOptions {
        ticks: cli.ticks,
        bodies: cli.bodies,
        seed: cli.seed,
        extent: cli.extent,
        watch: cli.watch.then(|| cli.config.clone()),
    };
    match demo::run(cfg, &opts) {
        Ok(summary) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("demo failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
