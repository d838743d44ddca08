//! valve-host — supervisor entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Build the valve factory, path registry and pipeline
//!   6. Add and start every configured valve, print the status tree
//!   7. Spawn Ctrl-C → shutdown watcher and SIGHUP → base path reload
//!   8. Run the supervisor reconfiguration loop until shutdown
//!   9. Stop every valve, last first

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use valve_host::config;
use valve_host::error::AppError;
use valve_host::factory::ValveFactory;
use valve_host::host::ValvePipeline;
use valve_host::logger;
use valve_host::path::PathRegistry;
use valve_host::supervisor::{self, Supervisor};
use valve_host::valve::builtin;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.host.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some())?;

    info!(
        host = %config.host.name,
        work_dir = %config.host.work_dir.display(),
        source = %config.source.display(),
        valves = config.valves.len(),
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let mut factory = ValveFactory::new();
    builtin::register_builtins(&mut factory);
    let factory = Arc::new(factory);
    let paths = Arc::new(PathRegistry::with_bases(config.paths.iter().cloned()));
    let pipeline = Arc::new(ValvePipeline::new());

    let mut sup = Supervisor::new(factory, paths.clone(), pipeline.clone());
    for descriptor in config.valves.iter().cloned() {
        sup.add(descriptor)?;
    }
    let events = sup
        .take_events()
        .ok_or_else(|| AppError::Config("reconfiguration channel already taken".into()))?;

    for failure in sup.start_all() {
        error!(error = %failure, "valve not installed");
    }
    info!(installed = pipeline.len(), "pipeline ready");

    match serde_json::to_string_pretty(&sup.component_tree()) {
        Ok(tree) => println!("{tree}"),
        Err(e) => warn!(error = %e, "cannot render component tree"),
    }

    // Shared shutdown token; Ctrl-C cancels it and every task watches it.
    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    #[cfg(unix)]
    spawn_path_reload(
        config.source.clone(),
        config.paths.iter().map(|(name, _)| name.clone()).collect(),
        paths.clone(),
        shutdown.clone(),
    );

    let services = sup.services().to_vec();
    let sup_token = shutdown.clone();
    let sup_handle = tokio::spawn(async move {
        supervisor::run(events, sup_token, services).await;
    });

    sup_handle.await.ok();
    sup.stop_all();
    info!(remaining = pipeline.len(), "shutdown complete");

    Ok(())
}

/// Re-read `[paths]` from the config file on every SIGHUP and push the values
/// into the registry. Moved bases fire path callbacks, which restart the
/// valves that depend on them.
#[cfg(unix)]
fn spawn_path_reload(
    source: PathBuf,
    mut known: HashSet<String>,
    paths: Arc<PathRegistry>,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler, path reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(source = %source.display(), "SIGHUP received, reloading base paths");
                    reload_paths(&source, &mut known, &paths);
                }
            }
        }
    });
}

#[cfg(unix)]
fn reload_paths(source: &Path, known: &mut HashSet<String>, paths: &PathRegistry) {
    let cfg = match config::load_path(source) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "config reload failed, base paths unchanged");
            return;
        }
    };

    let mut fired = 0;
    let mut current = HashSet::new();
    for (name, path) in cfg.paths {
        fired += paths.set_base(&name, path);
        current.insert(name);
    }
    for removed in known.difference(&current) {
        fired += paths.remove_base(removed);
    }
    *known = current;
    info!(callbacks = fired, "base paths reloaded");
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: valve-host [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: {})", config::DEFAULT_CONFIG_PATH);
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    //   -v     → warn
    //   -vv    → info
    //   -vvv   → debug  (registration, property application, callbacks)
    //   -vvvv+ → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path }
}
