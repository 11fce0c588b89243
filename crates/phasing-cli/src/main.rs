//! phasing CLI
//!
//! `phasing [SERVICE] [LOCAL_PORT]` redirects SERVICE to LOCAL_PORT on this
//! machine until interrupted. `phasing --init` prepares the cluster.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phasing::cli::{load_settings, resolve_kubeconfig, Cli};
use phasing::commands;
use phasing::output::{print_error, print_failure};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_filter()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if cli.init {
        return match init(&cli).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                print_error(&format!("Initialization failed: {:#}", e));
                ExitCode::FAILURE
            }
        };
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_failure(&e);
            ExitCode::FAILURE
        }
    }
}

async fn init(cli: &Cli) -> Result<()> {
    let mut config = load_settings(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let kubeconfig = resolve_kubeconfig(&config);
    commands::run_init(&config, kubeconfig).await
}

async fn run(cli: &Cli) -> Result<()> {
    let mut config = load_settings(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let kubeconfig = resolve_kubeconfig(&config);
    commands::run_session(config, cli.service_name(), kubeconfig).await
}
