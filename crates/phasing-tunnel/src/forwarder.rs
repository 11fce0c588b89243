//! Accept loop pairing inbound tunnel connections with local connections

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use phasing_core::error::TunnelError;
use phasing_core::Endpoint;

use crate::copier::relay;

/// A connection accepted on the agent side of the tunnel
pub struct Inbound<S> {
    /// Byte stream of the connection
    pub stream: S,
    /// Address of the client as reported by the agent
    pub peer: String,
}

/// Source of inbound tunnel connections
#[async_trait]
pub trait TunnelListener: Send {
    /// Stream type of accepted connections
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection.
    ///
    /// Returns `Ok(None)` once the underlying transport is gone. An `Err`
    /// only affects the connection being accepted.
    async fn accept(&mut self) -> Result<Option<Inbound<Self::Stream>>, TunnelError>;
}

/// Relays every accepted connection to a local endpoint
#[derive(Debug, Clone)]
pub struct Forwarder {
    /// Where accepted connections are delivered
    local: Endpoint,
    /// Timeout for dialing the local endpoint
    dial_timeout: Duration,
    /// Cap on concurrently relayed connections
    limiter: Option<Arc<Semaphore>>,
}

impl Forwarder {
    /// Create a forwarder delivering to `local`
    pub fn new(local: Endpoint, dial_timeout: Duration) -> Self {
        Self {
            local,
            dial_timeout,
            limiter: None,
        }
    }

    /// Limit the number of connections relayed at the same time.
    ///
    /// Once the limit is reached, further accepts wait for a relay to finish.
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.limiter = max.filter(|m| *m > 0).map(|m| Arc::new(Semaphore::new(m)));
        self
    }

    /// Local endpoint connections are delivered to
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Run the accept loop until the listener's transport goes away.
    ///
    /// Failed accepts and failed local dials are logged and skipped.
    /// Relays already in flight keep running after this returns.
    pub async fn serve<L: TunnelListener>(&self, listener: &mut L) -> Result<(), TunnelError> {
        loop {
            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(()),
                },
                None => None,
            };

            let inbound = match listener.accept().await {
                Ok(Some(inbound)) => inbound,
                Ok(None) => {
                    tracing::info!("Tunnel transport closed, no more connections");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    continue;
                }
            };

            let Inbound { mut stream, peer } = inbound;
            tracing::debug!("Accepted tunnel connection from {}", peer);

            let local = match self.dial_local().await {
                Ok(local) => local,
                Err(e) => {
                    tracing::warn!("{}", e);
                    if let Err(e) = stream.shutdown().await {
                        tracing::trace!("Closing inbound connection from {}: {}", peer, e);
                    }
                    continue;
                }
            };

            tokio::spawn(async move {
                let stats = relay(stream, local).await;
                tracing::debug!(
                    "Connection from {} closed ({} bytes in, {} bytes out)",
                    peer,
                    stats.a_to_b,
                    stats.b_to_a
                );
                drop(permit);
            });
        }
    }

    /// Dial the local endpoint
    async fn dial_local(&self) -> Result<TcpStream, TunnelError> {
        let address = self.local.address();
        let failed = |reason: String| TunnelError::LocalDialFailed {
            endpoint: address.clone(),
            reason,
        };

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| failed(format!("timed out after {:?}", self.dial_timeout)))?
            .map_err(|e| failed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Listener handing out pre-built connections, then reporting transport loss
    struct ScriptedListener {
        script: VecDeque<Result<Inbound<DuplexStream>, TunnelError>>,
    }

    #[async_trait]
    impl TunnelListener for ScriptedListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> Result<Option<Inbound<DuplexStream>>, TunnelError> {
            match self.script.pop_front() {
                Some(Ok(inbound)) => Ok(Some(inbound)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }

    fn inbound(peer: &str) -> (DuplexStream, Inbound<DuplexStream>) {
        let (client, stream) = duplex(1024);
        (
            client,
            Inbound {
                stream,
                peer: peer.to_string(),
            },
        )
    }

    async fn echo_server() -> (Endpoint, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (Endpoint::new("127.0.0.1", port), handle)
    }

    async fn closed_port() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_relays_to_local_service() {
        let (local, _server) = echo_server().await;
        let (mut client, conn) = inbound("10.0.0.7:51000");
        let mut listener = ScriptedListener {
            script: VecDeque::from([Ok(conn)]),
        };

        let forwarder = Forwarder::new(local, Duration::from_secs(1));
        forwarder.serve(&mut listener).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_failed_dial_closes_inbound_and_keeps_accepting() {
        let local = closed_port().await;
        let (mut first, conn1) = inbound("10.0.0.7:51000");
        let (mut second, conn2) = inbound("10.0.0.7:51001");
        let mut listener = ScriptedListener {
            script: VecDeque::from([Ok(conn1), Ok(conn2)]),
        };

        let forwarder = Forwarder::new(local, Duration::from_secs(1));
        forwarder.serve(&mut listener).await.unwrap();

        // Both connections were taken off the listener and closed.
        assert!(listener.script.is_empty());
        let mut buf = Vec::new();
        assert_eq!(first.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(second.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_error_does_not_end_loop() {
        let (local, _server) = echo_server().await;
        let (mut client, conn) = inbound("10.0.0.7:51000");
        let mut listener = ScriptedListener {
            script: VecDeque::from([
                Err(TunnelError::AcceptError("unexpected port 9999".to_string())),
                Ok(conn),
            ]),
        };

        let forwarder = Forwarder::new(local, Duration::from_secs(1));
        forwarder.serve(&mut listener).await.unwrap();

        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_max_connections_waits_for_free_slot() {
        let (local, _server) = echo_server().await;
        let (mut first, conn1) = inbound("10.0.0.7:51000");
        let (mut second, conn2) = inbound("10.0.0.7:51001");
        let mut listener = ScriptedListener {
            script: VecDeque::from([Ok(conn1), Ok(conn2)]),
        };

        let forwarder =
            Forwarder::new(local, Duration::from_secs(1)).with_max_connections(Some(1));
        let serve = tokio::spawn(async move {
            forwarder.serve(&mut listener).await.unwrap();
            listener
        });

        first.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();

        // The second connection is not relayed while the first one is live.
        second.write_all(b"two").await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(100), second.read_exact(&mut buf)).await;
        assert!(waiting.is_err());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
            .await
            .expect("second connection never relayed")
            .unwrap();
        assert_eq!(&buf, b"two");

        drop(second);
        let listener = tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("accept loop stuck")
            .unwrap();
        assert!(listener.script.is_empty());
    }
}
