//! Command-line arguments and how they combine with the config file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use phasing_core::config::{self, PhasingConfig};
use phasing_core::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "phasing")]
#[command(author, version, about = "Redirect a Kubernetes Service to a process on your machine")]
#[command(
    long_about = "Redirect a Kubernetes Service to a process on your machine.\n\n\
    The Service's selector is pointed at the in-cluster phasing agent, and every connection \
    the agent receives is relayed over a reverse SSH tunnel to LOCAL_PORT. The original \
    selector is restored on exit."
)]
pub struct Cli {
    /// Service to redirect (overrides --service). Prompts when omitted.
    #[arg(value_name = "SERVICE")]
    pub service_arg: Option<String>,

    /// Local port to deliver traffic to (overrides --port)
    #[arg(value_name = "LOCAL_PORT")]
    pub port_arg: Option<u16>,

    /// Service to redirect
    #[arg(short, long)]
    pub service: Option<String>,

    /// Local port to deliver traffic to [default: 7777]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Namespace of the Service [default: current kubeconfig context]
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Generate the SSH key and publish it to the cluster, then exit
    #[arg(long)]
    pub init: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `phasing=debug` (RUST_LOG takes precedence)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Service named on the command line, positional first
    pub fn service_name(&self) -> Option<String> {
        self.service_arg.clone().or_else(|| self.service.clone())
    }

    /// Local port given on the command line, positional first
    pub fn local_port(&self) -> Option<u16> {
        self.port_arg.or(self.port)
    }

    /// Log filter used when `RUST_LOG` is not set
    pub fn log_filter(&self) -> String {
        if self.verbose {
            return "debug".to_string();
        }
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    /// Apply command-line overrides to the file configuration
    pub fn apply(&self, config: &mut PhasingConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = Some(namespace.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(port) = self.local_port() {
            config.local_port = port;
        }
    }
}

/// Load the configuration file.
///
/// An explicit path must exist; the default location may be missing, in
/// which case built-in defaults are used.
pub fn load_settings(path: Option<&Path>) -> Result<PhasingConfig> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let path = config::default_config_path();
            match config::load_config::<PhasingConfig>(&path) {
                Ok(config) => Ok(config),
                Err(ConfigError::NotFound(_)) => {
                    tracing::debug!("No config at {}, using defaults", path.display());
                    Ok(PhasingConfig::default())
                }
                Err(e) => Err(e).with_context(|| {
                    format!("Failed to load config from {}", path.display())
                }),
            }
        }
    }
}

/// Kubeconfig to use: the configured one, else the default location if it exists.
///
/// `None` lets the client fall back to in-cluster configuration.
pub fn resolve_kubeconfig(config: &PhasingConfig) -> Option<PathBuf> {
    config
        .kubeconfig
        .clone()
        .or_else(|| config::default_kubeconfig_path().filter(|path| path.exists()))
}
