//! Core error types for phasing

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for a phasing session
#[derive(Error, Debug)]
pub enum PhasingError {
    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Control channel error
    #[error("Control channel error: {0}")]
    ControlChannel(#[from] ControlChannelError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No Service could be chosen
    #[error("No service selected: {0}")]
    Selection(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the Kubernetes API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Cluster unreachable, unauthorized, or any other API failure
    #[error("Kubernetes API request failed: {0}")]
    Unreachable(String),

    /// The named Service does not exist
    #[error("Service {name} not found in namespace {namespace}")]
    NotFound { namespace: String, name: String },

    /// The Service declares no ports, so there is nothing to listen on
    #[error("Service {name} in namespace {namespace} declares no ports")]
    NoPorts { namespace: String, name: String },

    /// The write was based on a stale resourceVersion
    #[error("Conflicting update to Service {name}")]
    Conflict { name: String },

    /// Every retry of a read-modify-write hit a conflict
    #[error("Gave up updating Service {name} after {attempts} conflicting attempts")]
    ConflictExhausted { name: String, attempts: u32 },

    /// The recovery annotation on the Service could not be decoded
    #[error("Invalid recovery annotation on Service {name}: {reason}")]
    InvalidAnnotation { name: String, reason: String },
}

/// Errors establishing or keeping the control channel to the agent
#[derive(Error, Debug)]
pub enum ControlChannelError {
    /// The port-forward process could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No forwarding port was reported in time
    #[error("Timed out after {0:?} waiting for the agent port-forward")]
    BootstrapTimeout(Duration),

    /// The port-forward process exited before reporting a port
    #[error("Agent unreachable: {0}")]
    AgentUnreachable(String),

    /// The port-forward process died while the tunnel was up
    #[error("Control channel lost: {0}")]
    ControlChannelLost(String),
}

/// Errors raised by the SSH tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Private key could not be read or parsed
    #[error("Private key not found at {path}: {reason}")]
    KeyNotFound { path: PathBuf, reason: String },

    /// SSH connection could not be established
    #[error("Failed to connect to agent: {0}")]
    Connect(String),

    /// The agent refused our key
    #[error("Authentication rejected by agent")]
    AuthRejected,

    /// The agent refused to open the remote listener
    #[error("Failed to listen on the agent side: {0}")]
    ListenSetupFailed(String),

    /// A single accept failed
    #[error("Failed to accept forwarded connection: {0}")]
    AcceptError(String),

    /// Local service refused or timed out
    #[error("Failed to dial local service at {endpoint}: {reason}")]
    LocalDialFailed { endpoint: String, reason: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
