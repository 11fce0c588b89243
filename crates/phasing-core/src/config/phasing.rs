//! Session configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::{selector, Selector};

/// Configuration for a phasing session.
///
/// Every field has a default, so an empty (or missing) config file is valid.
/// Command-line flags are applied on top of these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasingConfig {
    /// Namespace of the Service. Defaults to the kubeconfig's current context.
    pub namespace: Option<String>,

    /// Path to the kubeconfig file
    pub kubeconfig: Option<PathBuf>,

    /// Port of the local process that should receive the traffic
    pub local_port: u16,

    /// Host of the local process
    pub local_host: String,

    /// Name of the agent pod
    pub agent_pod: String,

    /// Namespace of the agent pod. Defaults to the Service namespace.
    pub agent_namespace: Option<String>,

    /// SSH port inside the agent pod
    pub agent_ssh_port: u16,

    /// Address `kubectl port-forward` binds locally
    pub forward_address: String,

    /// `kubectl` executable
    pub kubectl: String,

    /// Username for SSH authentication
    pub ssh_user: String,

    /// Path to the private key for authentication
    pub private_key_path: PathBuf,

    /// Address requested for the reverse listener on the agent. Whether sshd
    /// honors it depends on its `GatewayPorts` setting.
    pub remote_bind_address: String,

    /// Expected agent host key fingerprint. Any key is accepted when unset.
    pub agent_host_key: Option<String>,

    /// How long to wait for the port-forward to report its port
    #[serde(with = "duration_secs")]
    pub bootstrap_timeout: Duration,

    /// SSH connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for dialing the local process
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Maximum number of concurrently relayed connections (unbounded when unset)
    pub max_connections: Option<usize>,

    /// Manifest applied with `kubectl apply -f` by `--init`
    pub agent_manifest: Option<PathBuf>,

    /// Selector written to the Service while it is redirected.
    /// Must match the labels of the agent pod.
    pub redirect_selector: Selector,

    /// Retry policy for conflicting Service updates
    pub conflict_retry: BackoffConfig,
}

impl Default for PhasingConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kubeconfig: None,
            local_port: 7777,
            local_host: "localhost".to_string(),
            agent_pod: "phasing".to_string(),
            agent_namespace: None,
            agent_ssh_port: 22,
            forward_address: "127.0.0.1".to_string(),
            kubectl: "kubectl".to_string(),
            ssh_user: "root".to_string(),
            private_key_path: dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("phasing_key"),
            remote_bind_address: "localhost".to_string(),
            agent_host_key: None,
            redirect_selector: selector([("app", "phasing")]),
            bootstrap_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            conflict_retry: BackoffConfig::default(),
            max_connections: None,
            agent_manifest: None,
        }
    }
}

impl PhasingConfig {
    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_port == 0 {
            return Err(ConfigError::Invalid("local_port must not be 0".to_string()));
        }
        if self.agent_ssh_port == 0 {
            return Err(ConfigError::Invalid("agent_ssh_port must not be 0".to_string()));
        }
        if self.redirect_selector.is_empty() {
            // An empty selector would match every pod in the namespace
            return Err(ConfigError::Invalid(
                "redirect_selector must not be empty".to_string(),
            ));
        }
        if self.conflict_retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "conflict_retry.attempts must be at least 1".to_string(),
            ));
        }
        let multiplier = self.conflict_retry.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "conflict_retry.multiplier must be a finite number >= 1.0, got {}",
                multiplier
            )));
        }
        let jitter = self.conflict_retry.jitter;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::Invalid(format!(
                "conflict_retry.jitter must be between 0.0 and 1.0, got {}",
                jitter
            )));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration for optimistic-concurrency writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total number of attempts, including the first one
    pub attempts: u32,

    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    // Same shape as client-go's retry.DefaultRetry
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PhasingConfig::default();
        assert_eq!(config.local_port, 7777);
        assert_eq!(config.agent_ssh_port, 22);
        assert_eq!(config.ssh_user, "root");
        assert_eq!(
            config.redirect_selector.get("app").map(String::as_str),
            Some("phasing")
        );
        assert!(config.private_key_path.ends_with(".ssh/phasing_key"));
        assert_eq!(config.conflict_retry.attempts, 5);
    }

    #[test]
    fn test_validate() {
        assert!(PhasingConfig::default().validate().is_ok());

        let config = PhasingConfig {
            local_port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("local_port")));

        let config = PhasingConfig {
            redirect_selector: Selector::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PhasingConfig {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_conflict_retry() {
        let with_retry = |multiplier: f64, jitter: f64| PhasingConfig {
            conflict_retry: BackoffConfig {
                multiplier,
                jitter,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(with_retry(1.0, 0.0).validate().is_ok());
        assert!(with_retry(2.5, 1.0).validate().is_ok());

        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(with_retry(multiplier, 0.1).validate(), Err(ConfigError::Invalid(msg)) if msg.contains("multiplier")),
                "multiplier {} accepted",
                multiplier
            );
        }
        for jitter in [-0.1, 1.5, f64::NAN] {
            assert!(
                matches!(with_retry(1.0, jitter).validate(), Err(ConfigError::Invalid(msg)) if msg.contains("jitter")),
                "jitter {} accepted",
                jitter
            );
        }
    }

    #[test]
    fn test_backoff_serializes_millis() {
        let json = serde_json::to_value(BackoffConfig::default()).unwrap();
        assert_eq!(json["initial"], 10);
        assert_eq!(json["max"], 1000);
    }
}
