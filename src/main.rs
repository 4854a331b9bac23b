pub mod models {
    pub mod envoy;
    pub mod sample;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod point;
    pub mod sink;
    pub mod timescale;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod boundary;
    pub mod cadence;
    pub mod highrate;
    pub mod poller;
    pub mod rollup;
    pub mod sampling;
    pub mod scheduler;
    pub mod stale;
}
#[cfg(test)]
mod testing;

use crate::client::EnvoyClient;
use crate::config::{Config, load_env_file};
use crate::db::timescale::TimescaleSink;
use crate::services::rollup::{RollupPlan, Rollups};
use crate::services::sampling::Sampler;
use crate::services::scheduler;
use crate::utils::SystemClock;
use log::{debug, error, info};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment file applied before startup, for the startup log.
#[derive(Debug)]
struct EnvSource {
    path: PathBuf,
    from_cli: bool,
    applied: usize,
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (gateway={}, interval={}s, battery_ratio=1/{}, source={}, destinations={}/{}/{}, hourly={}, daily={}, scheduler={}, inverters={}, counter_sources={})",
        cfg.envoy_url,
        cfg.sample_interval.as_secs(),
        cfg.battery_sample_ratio.get(),
        cfg.source_tag,
        cfg.destinations.high_rate,
        cfg.destinations.hourly,
        cfg.destinations.daily,
        cfg.hourly_rollup_enabled,
        cfg.daily_rollup_enabled,
        cfg.rollup_scheduler_enabled,
        cfg.inverter_tags.serials().len(),
        cfg.counter_sources.len()
    );

    // 2) Connect DB
    let mut sink = TimescaleSink::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Gateway client
    let client = EnvoyClient::new(&cfg.envoy_url, &cfg.envoy_token, cfg.envoy_timeout);

    // 4) Rollups, shared by the loop and the optional scheduler
    let rollups = Arc::new(Rollups::new(RollupPlan::from_config(&cfg)));
    if cfg.rollup_scheduler_enabled {
        let scheduler_sink = TimescaleSink::connect(&cfg.database_url)
            .map_err(|e| format!("DB connection for rollup scheduler failed: {}", e))?;
        scheduler::spawn(Arc::clone(&rollups), scheduler_sink, SystemClock)
            .map_err(|e| format!("starting rollup scheduler failed: {}", e))?;
    } else {
        info!(
            "Rollup scheduler disabled via ROLLUP_SCHEDULER_ENABLED={}",
            cfg.rollup_scheduler_enabled
        );
    }

    // 5) Sampling loop
    info!(
        "Starting sampling loop: gateway={}, interval={}s",
        cfg.envoy_url,
        cfg.sample_interval.as_secs()
    );
    let clock = SystemClock;
    let mut sampler = Sampler::new(&cfg, &client, &mut sink, &clock, rollups);
    sampler.run().map_err(|e| e.to_string())
}

const ENV_FILE_FLAG: &str = "--env-file";

/// Reads `--env-file PATH` or `--env-file=PATH`, the only option, from the arguments after the
/// program name.
fn env_file_arg(mut args: impl Iterator<Item = OsString>) -> Result<Option<PathBuf>, String> {
    let mut env_file = None;
    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|raw| format!("argument is not valid UTF-8: {}", raw.to_string_lossy()))?;
        let path = match arg.split_once('=') {
            _ if arg == "--" => break,
            _ if arg == ENV_FILE_FLAG => args.next().map(PathBuf::from),
            Some((ENV_FILE_FLAG, value)) => Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty()),
            _ => return Err(format!("unrecognised argument: {}", arg)),
        };
        let path = path.ok_or_else(|| format!("{} needs a path", ENV_FILE_FLAG))?;
        if env_file.replace(path).is_some() {
            return Err(format!("{} given more than once", ENV_FILE_FLAG));
        }
    }
    Ok(env_file)
}

/// Applies the file named on the command line, else `.env` in the working directory if present.
fn load_environment(cli_path: Option<PathBuf>) -> Result<Option<EnvSource>, String> {
    let from_cli = cli_path.is_some();
    let path = match cli_path {
        Some(path) if path.is_file() => path,
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => match std::env::current_dir() {
            Ok(cwd) if cwd.join(".env").is_file() => cwd.join(".env"),
            Ok(_) => return Ok(None),
            Err(e) => return Err(format!("unable to read current directory: {}", e)),
        },
    };
    let applied = load_env_file(&path)?;
    Ok(Some(EnvSource { path, from_cli, applied }))
}

fn main() {
    let env_source = match env_file_arg(std::env::args_os().skip(1)).and_then(load_environment) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // After the environment, so RUST_LOG may come from the env file.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    info!(
        "envoy-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    match &env_source {
        Some(source) => info!(
            "Applied {} variable(s) from {} ({})",
            source.applied,
            source.path.display(),
            if source.from_cli { ENV_FILE_FLAG } else { "working directory" }
        ),
        None => debug!("No env file; using the process environment only"),
    }

    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
