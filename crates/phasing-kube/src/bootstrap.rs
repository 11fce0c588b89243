//! Control channel to the agent pod
//!
//! The channel is a `kubectl port-forward` child process. It binds an
//! ephemeral local port and announces it on stdout with a line like
//! `Forwarding from 127.0.0.1:40123 -> 22`; that port is where the SSH
//! tunnel connects. The child stays alive for the whole session and its
//! exit is reported through [`ControlChannel::lost`].

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use phasing_core::error::ControlChannelError;

static FORWARDING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Forwarding from (\S+):(\d+) -> (\d+)").expect("Invalid forwarding regex")
});

/// Extract the local port from a port-forward status line.
///
/// Only lines forwarding to `remote_port` count; anything else (IPv6
/// duplicates for other ports, handling notices) yields `None`.
pub fn parse_forwarding_port(line: &str, remote_port: u16) -> Option<u16> {
    let caps = FORWARDING_LINE.captures(line.trim())?;
    let remote: u16 = caps.get(3)?.as_str().parse().ok()?;
    if remote != remote_port {
        return None;
    }
    caps.get(2)?.as_str().parse().ok()
}

/// Command line of the port-forward process
#[derive(Debug, Clone)]
pub struct ForwardCommand {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Port inside the pod that is forwarded
    pub remote_port: u16,
}

impl ForwardCommand {
    /// Arbitrary command that prints `Forwarding from ...` lines
    pub fn new(program: impl Into<String>, args: Vec<String>, remote_port: u16) -> Self {
        Self {
            program: program.into(),
            args,
            remote_port,
        }
    }

    /// `kubectl port-forward` to the agent pod on an ephemeral local port
    pub fn kubectl(
        kubectl: &str,
        kubeconfig: Option<&Path>,
        namespace: &str,
        pod: &str,
        address: &str,
        remote_port: u16,
    ) -> Self {
        let mut args = Vec::new();
        if let Some(path) = kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        args.extend([
            "--namespace".to_string(),
            namespace.to_string(),
            "port-forward".to_string(),
            format!("--address={}", address),
            format!("pod/{}", pod),
            format!("0:{}", remote_port),
        ]);

        Self::new(kubectl, args, remote_port)
    }

    /// Printable command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running port-forward to the agent
pub struct ControlChannel {
    local_port: u16,
    lost: CancellationToken,
    shutdown: CancellationToken,
    exit_reason: Arc<Mutex<Option<String>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Start the port-forward and wait up to `timeout` for its local port.
    pub async fn open(command: &ForwardCommand, timeout: Duration) -> Result<Self, ControlChannelError> {
        tracing::debug!("Starting control channel: {}", command.display());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ControlChannelError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let last_stderr: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (port_tx, port_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            let remote_port = command.remote_port;
            tokio::spawn(async move {
                let mut port_tx = Some(port_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!("port-forward: {}", line);
                    if let Some(port) = parse_forwarding_port(&line, remote_port) {
                        if let Some(tx) = port_tx.take() {
                            let _ = tx.send(port);
                        }
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let last_stderr = last_stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("port-forward stderr: {}", line);
                    if !line.trim().is_empty() {
                        *lock(&last_stderr) = Some(line);
                    }
                }
            });
        }

        let lost = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let exit_reason = Arc::new(Mutex::new(None));

        let supervisor = tokio::spawn(supervise(
            child,
            shutdown.clone(),
            lost.clone(),
            exit_reason.clone(),
            last_stderr,
        ));

        let mut channel = Self {
            local_port: 0,
            lost,
            shutdown,
            exit_reason,
            supervisor: Some(supervisor),
        };

        tokio::select! {
            biased;
            port = port_rx => match port {
                Ok(port) => {
                    tracing::info!("Control channel ready on local port {}", port);
                    channel.local_port = port;
                    Ok(channel)
                }
                Err(_) => {
                    // stdout closed without a port line: wait for the exit reason
                    let _ = tokio::time::timeout(timeout, channel.lost.cancelled()).await;
                    let reason = channel.exit_reason();
                    channel.shutdown().await;
                    Err(ControlChannelError::AgentUnreachable(reason))
                }
            },
            _ = tokio::time::sleep(timeout) => {
                channel.shutdown().await;
                Err(ControlChannelError::BootstrapTimeout(timeout))
            }
        }
    }

    /// Local port the agent's SSH server is reachable on
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the port-forward process has exited
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Wait until the port-forward process exits
    pub async fn lost(&self) -> ControlChannelError {
        self.lost.cancelled().await;
        ControlChannelError::ControlChannelLost(self.exit_reason())
    }

    /// Stop the port-forward process and wait for it to exit
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }

    fn exit_reason(&self) -> String {
        lock(&self.exit_reason)
            .clone()
            .unwrap_or_else(|| "port-forward exited".to_string())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for the child to exit (or be told to stop), then record why
async fn supervise(
    mut child: Child,
    shutdown: CancellationToken,
    lost: CancellationToken,
    exit_reason: Arc<Mutex<Option<String>>>,
    last_stderr: Arc<Mutex<Option<String>>>,
) {
    let reason = tokio::select! {
        status = child.wait() => {
            // Give the stderr reader a moment to record the final line
            tokio::time::sleep(Duration::from_millis(50)).await;
            let stderr = lock(&last_stderr).clone();
            match (status, stderr) {
                (Ok(status), Some(line)) => format!("port-forward exited ({}): {}", status, line),
                (Ok(status), None) => format!("port-forward exited ({})", status),
                (Err(e), _) => format!("failed to wait for port-forward: {}", e),
            }
        }
        _ = shutdown.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to kill port-forward: {}", e);
            }
            "port-forward stopped".to_string()
        }
    };

    tracing::debug!("Control channel ended: {}", reason);
    *lock(&exit_reason) = Some(reason);
    lost.cancel();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
