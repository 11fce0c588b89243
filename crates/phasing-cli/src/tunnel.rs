//! Reverse SSH tunnel used by real sessions

use std::time::Duration;

use async_trait::async_trait;

use phasing_core::error::TunnelError;
use phasing_core::Endpoint;
use phasing_tunnel::{Forwarder, TunnelOptions, TunnelSession};

use crate::coordinator::Tunnel;

/// Tunnel over an SSH session to the agent
pub struct SshTunnel {
    options: TunnelOptions,
    local: Endpoint,
    dial_timeout: Duration,
    max_connections: Option<usize>,
}

impl SshTunnel {
    pub fn new(
        options: TunnelOptions,
        local: Endpoint,
        dial_timeout: Duration,
        max_connections: Option<usize>,
    ) -> Self {
        Self {
            options,
            local,
            dial_timeout,
            max_connections,
        }
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn run(&mut self, agent: Endpoint, remote_port: u16) -> Result<(), TunnelError> {
        let mut session = TunnelSession::connect(&agent, &self.options).await?;
        let mut listener = session.listen(remote_port).await?;

        let forwarder = Forwarder::new(self.local.clone(), self.dial_timeout)
            .with_max_connections(self.max_connections);
        tracing::info!(
            "Relaying port {} on {} to {}",
            listener.port(),
            session.agent(),
            forwarder.local()
        );
        forwarder.serve(&mut listener).await?;

        // The accept loop only ends on its own when the transport is gone
        let closed = session.is_closed();
        session.close().await;
        Err(TunnelError::Connect(if closed {
            format!("SSH connection to agent at {} closed", agent)
        } else {
            format!("agent at {} stopped forwarding connections", agent)
        }))
    }
}
