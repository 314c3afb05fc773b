//! crashwatch CLI entry point.
//!
//! Provides `watch`, `attribute`, and `check-config` subcommands for
//! diagnosing a live process, attributing a saved stack trace, or validating
//! the configuration file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crashwatch::attribution::{Attributor, AttributorOptions, Fault};
use crashwatch::config::{self, Config, ConfigWatcher};
use crashwatch::guardian::{Guardian, HostCapabilities};
use crashwatch::logging::{init_cli, init_production, LogSettings};
use crashwatch::modules::ModuleRegistry;
use crashwatch::monitors::ProcfsProbe;
use crashwatch::sampling::procfs::ProcfsSampler;

/// crashwatch: crash-risk and stall diagnosis for plugin-extensible hosts.
#[derive(Parser)]
#[command(name = "crashwatch", version, about)]
struct Cli {
    /// Config file (default: `$CRASHWATCH_CONFIG` or `~/.crashwatch/crashwatch.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Watch a running process until interrupted.
    Watch {
        /// Process id to watch.
        #[arg(long)]
        pid: u32,

        /// The process has finished loading; skip the loading-phase watcher.
        #[arg(long)]
        loaded: bool,
    },
    /// Attribute a saved stack trace and/or a logger name to a module.
    Attribute {
        /// Stack trace file, or `-` for stdin.
        #[arg(long)]
        stack: Option<PathBuf>,

        /// Logger name to attribute.
        #[arg(long)]
        logger: Option<String>,
    },
    /// Validate the config file and print the effective settings.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };

    match cli.command {
        Command::Watch { pid, loaded } => handle_watch(&config_path, pid, loaded).await,
        Command::Attribute { stack, logger } => {
            handle_attribute(&config_path, stack.as_deref(), logger.as_deref())
        }
        Command::CheckConfig => handle_check_config(&config_path),
    }
}

/// Run the guardian against a live process until Ctrl-C.
async fn handle_watch(config_path: &Path, pid: u32, loaded: bool) -> anyhow::Result<()> {
    let config = config::load_or_default(config_path)?;
    let _logging_guard = init_production(&LogSettings::from_config(&config)?)?;

    let registry = Arc::new(
        ModuleRegistry::load(&config.modules).context("failed to load module registry")?,
    );

    let sampler = ProcfsSampler::new(pid)
        .with_context(|| format!("cannot sample process {pid}"))?;
    let host = HostCapabilities::new(Arc::new(sampler), Arc::new(ProcfsProbe::new(pid)));
    let guardian = Guardian::new(&config, registry, host);
    if loaded {
        guardian.loading_complete();
    }

    // Keep the watcher alive for the whole run; without one, config stays fixed.
    let watched = ConfigWatcher::spawn(config_path.to_path_buf(), config.clone());
    let (_config_watcher, config_rx) = match watched {
        Ok((watcher, rx)) => (Some(watcher), rx),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "config hot reload unavailable");
            let (_tx, rx) = watch::channel(Arc::new(config));
            (None, rx)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });

    info!(pid, config = %config_path.display(), "crashwatch watching process");
    guardian.run(config_rx, shutdown_rx).await
}

/// Attribute a stack trace file and/or a logger name, printing the result.
fn handle_attribute(
    config_path: &Path,
    stack: Option<&Path>,
    logger: Option<&str>,
) -> anyhow::Result<()> {
    init_cli();
    anyhow::ensure!(
        stack.is_some() || logger.is_some(),
        "nothing to attribute: pass --stack and/or --logger"
    );

    let config = config::load_or_default(config_path)?;
    let registry = Arc::new(
        ModuleRegistry::load(&config.modules).context("failed to load module registry")?,
    );
    let attributor = Attributor::new(registry, AttributorOptions::from(&config.attribution));

    if let Some(path) = stack {
        let text = read_input(path)?;
        let fault = Fault::parse(&text);
        let module = attributor.attribute_from_fault(&fault);
        println!("stack: {module}");
        match attributor.find_culprit_frame(&fault.stack) {
            Some(frame) => println!("culprit frame: {frame}"),
            None => println!("culprit frame: none"),
        }
    }

    if let Some(name) = logger {
        println!("logger: {}", attributor.attribute_from_logger_name(name));
    }
    Ok(())
}

/// Validate the config and print the effective settings as TOML.
fn handle_check_config(config_path: &Path) -> anyhow::Result<()> {
    init_cli();

    let config: Config = if config_path.exists() {
        config::load_config(config_path)?
    } else {
        println!("# {} not found, showing defaults", config_path.display());
        Config::default()
    };
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("# config OK: {}", config_path.display());
    print!("{rendered}");
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stack from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
