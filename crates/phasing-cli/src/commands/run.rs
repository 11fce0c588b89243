//! Default command: redirect a Service for the lifetime of the process

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use phasing_core::config::PhasingConfig;
use phasing_core::Endpoint;
use phasing_kube::{create_client, resolve_namespace, ForwardCommand, KubeServiceApi, ServiceApi};
use phasing_tunnel::{HostKeyPolicy, TunnelOptions};

use crate::coordinator::{Coordinator, Restorer, SessionPlan};
use crate::output::print_warning;
use crate::prompt::PromptChooser;
use crate::tunnel::SshTunnel;

/// Exit status after a forced restore on a second interrupt
pub const FORCED_EXIT_CODE: i32 = 130;

/// Host to reach a port-forward bound to `address`
pub fn agent_host(address: &str) -> String {
    match address {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" | "[::]" => "::1".to_string(),
        other => other.to_string(),
    }
}

/// Assemble the session from configuration
pub fn session_plan(
    config: &PhasingConfig,
    service: Option<String>,
    namespace: String,
    kubeconfig: Option<PathBuf>,
) -> SessionPlan {
    let agent_namespace = config
        .agent_namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());

    let forward = ForwardCommand::kubectl(
        &config.kubectl,
        kubeconfig.as_deref(),
        &agent_namespace,
        &config.agent_pod,
        &config.forward_address,
        config.agent_ssh_port,
    );

    SessionPlan {
        namespace,
        service,
        local: Endpoint::new(config.local_host.clone(), config.local_port),
        kubeconfig_path: kubeconfig,
        redirect_selector: config.redirect_selector.clone(),
        conflict_retry: config.conflict_retry.clone(),
        forward,
        bootstrap_timeout: config.bootstrap_timeout,
        agent_host: agent_host(&config.forward_address),
    }
}

/// Options for the SSH session to the agent
pub fn tunnel_options(config: &PhasingConfig) -> TunnelOptions {
    TunnelOptions {
        user: config.ssh_user.clone(),
        private_key_path: config.private_key_path.clone(),
        host_key: match &config.agent_host_key {
            Some(fingerprint) => HostKeyPolicy::Fingerprint(fingerprint.clone()),
            None => HostKeyPolicy::AcceptAny,
        },
        connect_timeout: config.connect_timeout,
        remote_bind_address: config.remote_bind_address.clone(),
    }
}

/// Run a session until it ends or the process is interrupted
pub async fn run_session(
    config: PhasingConfig,
    service: Option<String>,
    kubeconfig: Option<PathBuf>,
) -> Result<()> {
    let namespace = resolve_namespace(config.namespace.as_deref(), kubeconfig.as_deref());
    tracing::debug!("Using namespace {}", namespace);

    let client = create_client(kubeconfig.as_deref()).await?;
    let api = Arc::new(KubeServiceApi::new(client));

    let plan = session_plan(&config, service, namespace, kubeconfig);
    let tunnel = SshTunnel::new(
        tunnel_options(&config),
        plan.local.clone(),
        config.dial_timeout,
        config.max_connections,
    );

    let shutdown = CancellationToken::new();
    let mut coordinator = Coordinator::new(api, plan, Box::new(PromptChooser), tunnel, shutdown.clone());
    spawn_signal_handler(shutdown, coordinator.restorer());

    coordinator.run().await?;
    Ok(())
}

/// First signal: end the session (the main flow restores the Service).
/// Second signal: restore right here and exit.
fn spawn_signal_handler<A>(shutdown: CancellationToken, restorer: Restorer<A>)
where
    A: ServiceApi + 'static,
{
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        tracing::info!("Received {}, restoring the Service...", signal);
        shutdown.cancel();

        let signal = wait_for_signal().await;
        print_warning(&format!("Received {} again, forcing restore and exiting", signal));
        if let Err(e) = restorer.restore_once().await {
            tracing::error!("Forced restore failed: {}", e);
        }
        std::process::exit(FORCED_EXIT_CODE);
    });
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}
