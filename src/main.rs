//! cefhost CLI.
//!
//! This is the binary entry point. See the `cefhost` library for the
//! loader itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use cefhost::bootstrap::{self, Host};
use cefhost::plugins::manifest;
use cefhost::Config;
use clap::{Parser, Subcommand};

// CLI
#[derive(Parser)]
#[command(name = "cefhost")]
#[command(version)]
#[command(about = "Lua plugin loader for embedded Chromium hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to the host debugger and run plugins until interrupted
    Run {
        /// Config file (defaults to the user config directory)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Plugins directory, overriding the config
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
        /// Host launch parameters, e.g. -devtools-port=9222
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        host_args: Vec<String>,
    },
    /// Verify the debugger endpoint and print what was found
    Check {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Host launch parameters
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        host_args: Vec<String>,
    },
    /// Clone or fast-forward configured module mirrors
    Update {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List plugins found in the plugins directory
    Plugins {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Plugins directory, overriding the config
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>, plugins_dir: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(dir) = plugins_dir {
        config.plugins_dir = dir;
    }
    Ok(config)
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("CEFHOST_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .map_err(|e| anyhow::anyhow!("Failed to create log file at {path}: {e}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_millis().init();
    Ok(())
}

fn run(config: &Config, host_args: Vec<String>) -> Result<(), bootstrap::BootstrapError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::flag;
        for signal in [SIGINT, SIGTERM, SIGHUP] {
            flag::register(signal, Arc::clone(&shutdown)).map_err(anyhow::Error::from)?;
        }
    }

    let host = Host::start(config, host_args)?;
    log::info!(
        "[Main] cefhost v{} attached to {} (session {})",
        env!("CARGO_PKG_VERSION"),
        host.endpoint(),
        host.service().session_id()
    );

    host.run_until(&shutdown);
    log::info!("[Main] Shutting down...");
    host.shutdown();
    Ok(())
}

fn fatal(error: &dyn std::fmt::Display) -> ! {
    log::error!("[Main] {error}");
    eprintln!("cefhost: {error}");
    std::process::exit(1);
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            plugins_dir,
            host_args,
        } => {
            let config = load_config(config.as_deref(), plugins_dir)?;
            if let Err(e) = run(&config, host_args) {
                fatal(&e);
            }
        }
        Commands::Check { config, host_args } => {
            let config = load_config(config.as_deref(), None)?;
            match bootstrap::check(&config, host_args) {
                Ok(report) => {
                    println!("Endpoint:  {}", report.endpoint);
                    println!("Owner:     {:?}", report.verdict);
                    println!("Browser:   {}", report.browser.as_deref().unwrap_or("unknown"));
                    println!("WebSocket: {}", report.ws_url);
                }
                Err(e) => fatal(&e),
            }
        }
        Commands::Update { config } => {
            let config = load_config(config.as_deref(), None)?;
            if config.modules.is_empty() {
                println!("No modules configured.");
            }
            let mut failed = 0;
            for (path, ok) in bootstrap::update_modules(&config) {
                println!("{} {}", if ok { "ok    " } else { "FAILED" }, path.display());
                if !ok {
                    failed += 1;
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} module(s) could not be updated");
            }
        }
        Commands::Plugins { config, plugins_dir } => {
            let config = load_config(config.as_deref(), plugins_dir)?;
            let manifests = manifest::discover(&config.plugins_dir)?;
            if manifests.is_empty() {
                println!("No plugins in {}", config.plugins_dir.display());
            }
            for m in manifests {
                let state = if m.enabled { "enabled" } else { "disabled" };
                println!("{:<24} {:<9} {}", m.name, state, m.entry_path().display());
            }
        }
    }

    Ok(())
}
