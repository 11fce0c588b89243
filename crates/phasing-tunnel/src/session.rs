//! SSH session to the in-cluster agent
//!
//! Connects through the control channel, authenticates with the phasing key
//! and asks the agent to listen on the Service port. Connections the agent
//! accepts there come back as `forwarded-tcpip` channels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelStream, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;

use phasing_core::error::TunnelError;
use phasing_core::Endpoint;

use crate::forwarder::{Inbound, TunnelListener};

/// Capacity of the queue between the SSH handler and the accept loop.
///
/// Forwarded channels wait here until the accept loop picks them up. When it
/// is full, new channels are closed instead of stalling the session loop.
const FORWARDED_CHANNEL_CAPACITY: usize = 64;

/// How the agent's host key is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key. The control channel already runs over the
    /// authenticated Kubernetes API connection.
    AcceptAny,
    /// Only accept a key with this fingerprint
    Fingerprint(String),
}

/// Settings for the SSH session
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Username for SSH authentication
    pub user: String,
    /// Path to the private key for authentication
    pub private_key_path: PathBuf,
    /// Host key policy
    pub host_key: HostKeyPolicy,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Address the agent binds the remote listener to
    pub remote_bind_address: String,
}

/// An open, authenticated SSH session to the agent
pub struct TunnelSession {
    /// SSH session handle
    session: Handle<AgentHandler>,
    /// Forwarded connections, taken by the first `listen`
    forwarded_rx: Option<mpsc::Receiver<Forwarded>>,
    /// Endpoint the session was opened to
    agent: Endpoint,
    /// Address the agent binds the remote listener to
    bind_address: String,
}

impl TunnelSession {
    /// Connect and authenticate to the agent
    pub async fn connect(agent: &Endpoint, options: &TunnelOptions) -> Result<Self, TunnelError> {
        let key = load_key(&options.private_key_path)?;

        let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let handler = AgentHandler {
            host_key: options.host_key.clone(),
            forwarded_tx,
        };

        tracing::debug!("Connecting to agent at {}", agent);
        let mut session = tokio::time::timeout(
            options.connect_timeout,
            client::connect(Arc::new(Config::default()), agent.address(), handler),
        )
        .await
        .map_err(|_| TunnelError::Connect(format!("timed out connecting to {}", agent)))?
        .map_err(|e| TunnelError::Connect(format!("{}: {}", agent, e)))?;

        tracing::debug!("Authenticating as user '{}'", options.user);
        let authenticated = session
            .authenticate_publickey(&options.user, key)
            .await
            .map_err(|e| TunnelError::Connect(format!("authentication error: {}", e)))?;

        if !authenticated {
            return Err(TunnelError::AuthRejected);
        }

        tracing::info!("Connected to agent at {}", agent);
        Ok(Self {
            session,
            forwarded_rx: Some(forwarded_rx),
            agent: agent.clone(),
            bind_address: options.remote_bind_address.clone(),
        })
    }

    /// Endpoint of the agent
    pub fn agent(&self) -> &Endpoint {
        &self.agent
    }

    /// Ask the agent to listen on `port` and return the listener.
    ///
    /// Only one listener can be opened per session.
    pub async fn listen(&mut self, port: u16) -> Result<ForwardedListener, TunnelError> {
        let forwarded_rx = self.forwarded_rx.take().ok_or_else(|| {
            TunnelError::ListenSetupFailed("a listener is already open on this session".into())
        })?;

        let bound = self
            .session
            .tcpip_forward(self.bind_address.as_str(), u32::from(port))
            .await
            .map_err(|e| listen_error(e, &self.bind_address, port))?;

        tracing::info!(
            "Agent listening on {}:{} (bound port {})",
            self.bind_address,
            port,
            bound
        );
        Ok(ForwardedListener {
            port,
            forwarded_rx,
        })
    }

    /// Whether the SSH transport has gone away
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Close the session
    pub async fn close(self) {
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "phasing shutting down", "en")
            .await
        {
            tracing::debug!("Disconnect from agent failed: {}", e);
        }
    }
}

/// Listener on the agent side of the tunnel
pub struct ForwardedListener {
    /// Port the agent listens on
    port: u16,
    /// Forwarded channels from the SSH handler
    forwarded_rx: mpsc::Receiver<Forwarded>,
}

impl ForwardedListener {
    /// Port the agent listens on
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl TunnelListener for ForwardedListener {
    type Stream = ChannelStream<Msg>;

    async fn accept(&mut self) -> Result<Option<Inbound<Self::Stream>>, TunnelError> {
        let Some(forwarded) = self.forwarded_rx.recv().await else {
            return Ok(None);
        };

        if forwarded.connected_port != u32::from(self.port) {
            let _ = forwarded.channel.close().await;
            return Err(TunnelError::AcceptError(format!(
                "agent forwarded a connection for port {} but we listen on {}",
                forwarded.connected_port, self.port
            )));
        }

        Ok(Some(Inbound {
            stream: forwarded.channel.into_stream(),
            peer: forwarded.originator,
        }))
    }
}

/// A `forwarded-tcpip` channel opened by the agent
struct Forwarded {
    channel: Channel<Msg>,
    connected_port: u32,
    originator: String,
}

/// SSH client handler for the agent session
struct AgentHandler {
    /// Host key policy
    host_key: HostKeyPolicy,
    /// Forwarded channel sender
    forwarded_tx: mpsc::Sender<Forwarded>,
}

#[async_trait]
impl client::Handler for AgentHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Agent host key: {}", fingerprint);

        match &self.host_key {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::Fingerprint(expected) if *expected == fingerprint => Ok(true),
            HostKeyPolicy::Fingerprint(expected) => {
                tracing::error!(
                    "Agent host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(
            "Forwarded channel for {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        let forwarded = Forwarded {
            channel,
            connected_port,
            originator: format!("{}:{}", originator_address, originator_port),
        };

        if let Err(rejected) = queue_forwarded(&self.forwarded_tx, forwarded) {
            tracing::warn!(
                "Dropping forwarded connection from {}: no free slot in the accept queue",
                rejected.originator
            );
            let _ = rejected.channel.close().await;
        }
        Ok(())
    }
}

/// Hand a forwarded channel to the accept loop without waiting.
///
/// Returns the item back when the queue is full or the listener is gone.
fn queue_forwarded<T>(tx: &mpsc::Sender<T>, item: T) -> Result<(), T> {
    tx.try_send(item).map_err(|e| match e {
        mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
    })
}

/// Map a failed `tcpip-forward` request to a listen error
fn listen_error(error: russh::Error, bind_address: &str, port: u16) -> TunnelError {
    match error {
        russh::Error::RequestDenied => TunnelError::ListenSetupFailed(format!(
            "agent refused to listen on {}:{}",
            bind_address, port
        )),
        other => TunnelError::ListenSetupFailed(other.to_string()),
    }
}

/// Load the private key used to authenticate to the agent
fn load_key(path: &std::path::Path) -> Result<Arc<KeyPair>, TunnelError> {
    if !path.exists() {
        return Err(TunnelError::KeyNotFound {
            path: path.to_path_buf(),
            reason: "file does not exist".to_string(),
        });
    }

    let key = russh_keys::load_secret_key(path, None).map_err(|e| TunnelError::KeyNotFound {
        path: path.to_path_buf(),
        reason: format!("failed to load key: {}", e),
    })?;

    Ok(Arc::new(key))
}
