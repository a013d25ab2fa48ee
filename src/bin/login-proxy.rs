//! Command-line entry point for the login proxy.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use login_proxy::config::ProxyConfig;
use login_proxy::service::{resolver, LoginProxy};
use login_proxy::utils::{logging, ProxyMetrics};
use login_proxy::Result;

/// Transparent login proxy with server-list filtering and credential substitution
#[derive(Parser, Debug)]
#[command(name = "login-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy until interrupted
    Run {
        /// Path to configuration file; defaults are used when it does not exist
        #[arg(short, long, default_value = "login-proxy.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "login-proxy.toml")]
        config: PathBuf,
    },

    /// Print a configuration file with every default filled in
    ExampleConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::CheckConfig { config } => cmd_check_config(&config),
        Commands::ExampleConfig => {
            println!("{}", ProxyConfig::example_config());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "login-proxy failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// File if present, then environment overrides.
fn load_config(path: &Path) -> Result<ProxyConfig> {
    let mut config = if path.exists() {
        ProxyConfig::from_file(path)?
    } else {
        ProxyConfig::default()
    };
    config.apply_env()?;
    Ok(config)
}

async fn cmd_run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    logging::init(&config.logging);

    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
    }
    config.validate_strict()?;
    if config.encryption.is_placeholder() {
        warn!("DES key is all zeros; logins can only be rewritten if the server uses the same key");
    }

    let resolver = resolver::from_config(&config.accounts)?;
    let metrics = Arc::new(ProxyMetrics::new());
    let proxy = LoginProxy::bind(&config, resolver, Arc::clone(&metrics)).await?;

    proxy
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Login proxy stopped");
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let problems = config.validate();
    if problems.is_empty() {
        println!("{}: OK", path.display());
        return Ok(());
    }
    for problem in &problems {
        println!("  - {problem}");
    }
    config.validate_strict()
}
