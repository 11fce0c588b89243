//! Core domain types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A Service label selector
pub type Selector = BTreeMap<String, String>;

/// Build a selector from `(key, value)` pairs
pub fn selector<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Selector
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Render a selector the way `kubectl` shows it (`app=web,tier=frontend`)
pub fn format_selector(selector: Option<&Selector>) -> String {
    match selector {
        None => "<unset>".to_string(),
        Some(s) if s.is_empty() => "<empty>".to_string(),
        Some(s) => s
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// A host/port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on `localhost`
    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }

    /// `host:port` form accepted by `TcpStream::connect`
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Settings for one run, resolved once at startup.
///
/// `agent_port` is filled in when the control channel reports its port;
/// after that the snapshot is never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    /// Service to redirect
    pub service_name: String,
    /// Namespace of the Service
    pub namespace: String,
    /// Port of the developer's local process
    pub local_port: u16,
    /// Local end of the control channel
    pub agent_port: u16,
    /// Kubeconfig used for the API and for `kubectl`
    pub kubeconfig_path: Option<PathBuf>,
}

impl ResolvedSession {
    /// Copy of this session with the control channel port set
    pub fn with_agent_port(&self, agent_port: u16) -> Self {
        Self {
            agent_port,
            ..self.clone()
        }
    }
}
