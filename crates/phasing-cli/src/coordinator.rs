//! Session lifecycle
//!
//! Runs one phasing session end to end:
//!
//! ```text
//! Idle -> Bootstrapping -> Redirecting -> Tunneling -> Restoring -> Terminated
//! ```
//!
//! The Service is never touched before the control channel is up, and the
//! tunnel never accepts before the Service is redirected. Once a hijack has
//! succeeded, every way out of the session goes through [`Restorer`], which
//! runs the restore exactly once no matter how many paths ask for it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use phasing_core::config::BackoffConfig;
use phasing_core::error::{ClusterError, TunnelError};
use phasing_core::types::format_selector;
use phasing_core::{Endpoint, PhasingError, ResolvedSession, Selector};
use phasing_kube::redirector::ORIGINAL_SELECTOR_ANNOTATION;
use phasing_kube::{
    ControlChannel, ForwardCommand, ServiceApi, ServiceRedirectionState, ServiceRedirector,
};

use crate::output;

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Bootstrapping,
    Redirecting,
    Tunneling,
    Restoring,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Redirecting => "redirecting",
            Phase::Tunneling => "tunneling",
            Phase::Restoring => "restoring",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Relays traffic from the agent to the local process
#[async_trait]
pub trait Tunnel: Send {
    /// Open the tunnel through `agent` and serve connections arriving on
    /// `remote_port` until the tunnel ends.
    async fn run(&mut self, agent: Endpoint, remote_port: u16) -> Result<(), TunnelError>;
}

/// Picks a Service when none was named on the command line
#[async_trait]
pub trait ServiceChooser: Send + Sync {
    /// Choose one of `services` (never empty)
    async fn choose(&self, namespace: &str, services: Vec<String>) -> Result<String, PhasingError>;
}

/// Everything a session needs to know before it starts
#[derive(Debug, Clone)]
pub struct SessionPlan {
    /// Namespace of the Service
    pub namespace: String,
    /// Service to redirect; chosen interactively when `None`
    pub service: Option<String>,
    /// Where the redirected traffic is delivered
    pub local: Endpoint,
    /// Kubeconfig used for the API and for `kubectl`
    pub kubeconfig_path: Option<PathBuf>,
    /// Selector written while the Service is redirected
    pub redirect_selector: Selector,
    /// Retry policy for conflicting Service updates
    pub conflict_retry: BackoffConfig,
    /// Port-forward to the agent
    pub forward: ForwardCommand,
    /// How long to wait for the port-forward to report its port
    pub bootstrap_timeout: Duration,
    /// Host the port-forward is reachable on
    pub agent_host: String,
}

/// Runs the restore at most once, from whichever path gets there first
pub struct Restorer<A: ServiceApi + ?Sized> {
    redirector: Arc<OnceLock<Arc<ServiceRedirector<A>>>>,
    gate: Arc<OnceCell<Result<(), ClusterError>>>,
}

impl<A: ServiceApi + ?Sized> Clone for Restorer<A> {
    fn clone(&self) -> Self {
        Self {
            redirector: Arc::clone(&self.redirector),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<A: ServiceApi + ?Sized> Default for Restorer<A> {
    fn default() -> Self {
        Self {
            redirector: Arc::new(OnceLock::new()),
            gate: Arc::new(OnceCell::new()),
        }
    }
}

impl<A: ServiceApi + ?Sized> Restorer<A> {
    /// Restorer with nothing to restore yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over the redirector to restore. Only the first one is kept.
    fn attach(&self, redirector: Arc<ServiceRedirector<A>>) {
        if self.redirector.set(redirector).is_err() {
            tracing::debug!("Restorer already has a redirector");
        }
    }

    /// Whether the restore has already run (or is running)
    pub fn has_run(&self) -> bool {
        self.gate.initialized()
    }

    /// Restore the Service unless that already happened.
    ///
    /// Concurrent callers wait for the one restore in flight and all see its
    /// result.
    pub async fn restore_once(&self) -> Result<(), ClusterError> {
        self.gate
            .get_or_init(|| async {
                let Some(redirector) = self.redirector.get() else {
                    return Ok(());
                };

                let result = redirector.restore().await;
                if let Err(e) = &result {
                    let state = redirector.state().await;
                    tracing::error!(
                        "Failed to restore Service {}/{}: {}. Its original selector {} is kept in the {} annotation.",
                        state.namespace,
                        state.service_name,
                        e,
                        format_selector(state.original_selector().flatten()),
                        ORIGINAL_SELECTOR_ANNOTATION
                    );
                }
                result
            })
            .await
            .clone()
    }
}

/// Drives one session through its phases
pub struct Coordinator<A: ServiceApi + ?Sized, T: Tunnel> {
    api: Arc<A>,
    plan: SessionPlan,
    chooser: Box<dyn ServiceChooser>,
    tunnel: T,
    shutdown: CancellationToken,
    restorer: Restorer<A>,
    phase: Phase,
    session: Option<ResolvedSession>,
}

impl<A, T> Coordinator<A, T>
where
    A: ServiceApi + ?Sized + 'static,
    T: Tunnel,
{
    /// Create a coordinator. Cancelling `shutdown` ends the session.
    pub fn new(
        api: Arc<A>,
        plan: SessionPlan,
        chooser: Box<dyn ServiceChooser>,
        tunnel: T,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            plan,
            chooser,
            tunnel,
            shutdown,
            restorer: Restorer::new(),
            phase: Phase::Idle,
            session: None,
        }
    }

    /// Handle for restoring the Service from outside the main flow
    pub fn restorer(&self) -> Restorer<A> {
        self.restorer.clone()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Resolved settings, once the control channel is up and the Service is known
    pub fn session(&self) -> Option<&ResolvedSession> {
        self.session.as_ref()
    }

    fn transition(&mut self, to: Phase) {
        tracing::info!("Session {} -> {}", self.phase, to);
        self.phase = to;
    }

    /// Run the session to completion
    pub async fn run(&mut self) -> Result<(), PhasingError> {
        let shutdown = self.shutdown.clone();

        // Bootstrapping
        self.transition(Phase::Bootstrapping);
        let forward = self.plan.forward.clone();
        let timeout = self.plan.bootstrap_timeout;
        let opened = tokio::select! {
            result = ControlChannel::open(&forward, timeout) => Some(result),
            _ = shutdown.cancelled() => None,
        };
        let mut control = match opened {
            Some(Ok(control)) => control,
            Some(Err(e)) => {
                tracing::error!("Failed to open control channel: {}", e);
                self.transition(Phase::Terminated);
                return Err(e.into());
            }
            None => {
                tracing::info!("Interrupted while bootstrapping");
                self.transition(Phase::Terminated);
                return Ok(());
            }
        };

        // Redirecting
        self.transition(Phase::Redirecting);
        let service = match self.resolve_service(&shutdown).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                tracing::info!("Interrupted while choosing a service");
                control.shutdown().await;
                self.transition(Phase::Terminated);
                return Ok(());
            }
            Err(e) => {
                control.shutdown().await;
                self.transition(Phase::Terminated);
                return Err(e);
            }
        };

        let session = ResolvedSession {
            service_name: service.clone(),
            namespace: self.plan.namespace.clone(),
            local_port: self.plan.local.port,
            agent_port: 0,
            kubeconfig_path: self.plan.kubeconfig_path.clone(),
        }
        .with_agent_port(control.local_port());
        tracing::debug!("Resolved session: {:?}", session);
        self.session = Some(session.clone());

        let redirector = Arc::new(ServiceRedirector::new(
            Arc::clone(&self.api),
            ServiceRedirectionState::new(
                session.namespace.clone(),
                session.service_name.clone(),
                self.plan.redirect_selector.clone(),
            ),
            self.plan.conflict_retry.clone(),
        ));
        self.restorer.attach(Arc::clone(&redirector));

        // A hijack is never abandoned halfway; a signal that arrives meanwhile
        // is handled right after it.
        let remote_port = match redirector.hijack().await {
            Ok(port) => port,
            Err(e) => {
                tracing::error!("Failed to redirect Service {}: {}", session.service_name, e);
                control.shutdown().await;
                self.transition(Phase::Terminated);
                return Err(e.into());
            }
        };

        let outcome = if shutdown.is_cancelled() {
            Ok(())
        } else {
            // Tunneling
            self.transition(Phase::Tunneling);
            output::print_endpoints(
                &format!("{}.{}:{}", session.service_name, session.namespace, remote_port),
                &self.plan.local.to_string(),
            );

            let agent = Endpoint::new(self.plan.agent_host.clone(), session.agent_port);
            tokio::select! {
                result = self.tunnel.run(agent, remote_port) => match result {
                    Ok(()) => {
                        tracing::info!("Tunnel closed");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Tunnel failed: {}", e);
                        Err(PhasingError::from(e))
                    }
                },
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    Ok(())
                }
                lost = control.lost() => {
                    tracing::error!("{}", lost);
                    Err(PhasingError::from(lost))
                }
            }
        };

        // Restoring
        self.transition(Phase::Restoring);
        let restored = self.restorer.restore_once().await;
        control.shutdown().await;
        self.transition(Phase::Terminated);

        match (outcome, restored) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Name of the Service to redirect; `None` if interrupted
    async fn resolve_service(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>, PhasingError> {
        if let Some(service) = &self.plan.service {
            return Ok(Some(service.clone()));
        }

        let namespace = self.plan.namespace.as_str();
        let choose = async {
            let services = self.api.list_services(namespace).await?;
            if services.is_empty() {
                return Err(PhasingError::Selection(format!(
                    "no services found in namespace {}",
                    namespace
                )));
            }
            self.chooser.choose(namespace, services).await
        };

        tokio::select! {
            chosen = choose => chosen.map(Some),
            _ = shutdown.cancelled() => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasing_core::error::ControlChannelError;
    use phasing_core::types::selector;
    use phasing_kube::memory::{new_service, InMemoryServices};
    use std::sync::Mutex;

    const READY: &str = "echo 'Forwarding from 127.0.0.1:40123 -> 22'; exec sleep 30";

    /// What the fake tunnel does once it starts
    #[derive(Clone, Copy)]
    enum Behavior {
        /// Request shutdown, then wait forever
        Interrupt,
        /// Wait forever
        Hang,
        /// Fail right away
        Fail,
        /// Return right away
        Finish,
    }

    #[derive(Clone)]
    struct FakeTunnel {
        behavior: Behavior,
        shutdown: CancellationToken,
        api: Arc<InMemoryServices>,
        /// `(agent, remote_port, selector while tunneling)` per run
        runs: Arc<Mutex<Vec<(Endpoint, u16, Option<Selector>)>>>,
    }

    impl FakeTunnel {
        fn new(behavior: Behavior, shutdown: &CancellationToken, api: &Arc<InMemoryServices>) -> Self {
            Self {
                behavior,
                shutdown: shutdown.clone(),
                api: Arc::clone(api),
                runs: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn runs(&self) -> Vec<(Endpoint, u16, Option<Selector>)> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn run(&mut self, agent: Endpoint, remote_port: u16) -> Result<(), TunnelError> {
            let live = self.api.selector("default", "web");
            self.runs.lock().unwrap().push((agent, remote_port, live));

            match self.behavior {
                Behavior::Interrupt => {
                    self.shutdown.cancel();
                    std::future::pending().await
                }
                Behavior::Hang => std::future::pending().await,
                Behavior::Fail => Err(TunnelError::ListenSetupFailed("refused".to_string())),
                Behavior::Finish => Ok(()),
            }
        }
    }

    struct FirstService;

    #[async_trait]
    impl ServiceChooser for FirstService {
        async fn choose(&self, _namespace: &str, services: Vec<String>) -> Result<String, PhasingError> {
            Ok(services[0].clone())
        }
    }

    fn web_cluster() -> Arc<InMemoryServices> {
        let api = Arc::new(InMemoryServices::new());
        api.insert(
            "default",
            new_service("web", Some(selector([("app", "web")])), &[8080]),
        );
        api
    }

    fn plan(script: &str, service: Option<&str>) -> SessionPlan {
        SessionPlan {
            namespace: "default".to_string(),
            service: service.map(str::to_string),
            local: Endpoint::localhost(7777),
            kubeconfig_path: None,
            redirect_selector: selector([("app", "phasing")]),
            conflict_retry: BackoffConfig {
                attempts: 5,
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 1.0,
                jitter: 0.0,
            },
            forward: ForwardCommand::new("sh", vec!["-c".to_string(), script.to_string()], 22),
            bootstrap_timeout: Duration::from_secs(5),
            agent_host: "127.0.0.1".to_string(),
        }
    }

    fn coordinator(
        api: &Arc<InMemoryServices>,
        plan: SessionPlan,
        tunnel: FakeTunnel,
        shutdown: &CancellationToken,
    ) -> Coordinator<InMemoryServices, FakeTunnel> {
        Coordinator::new(
            Arc::clone(api),
            plan,
            Box::new(FirstService),
            tunnel,
            shutdown.clone(),
        )
    }

    #[tokio::test]
    async fn test_signal_restores_service_and_exits_cleanly() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Interrupt, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, Some("web")), tunnel.clone(), &shutdown);

        coordinator.run().await.unwrap();

        let runs = tunnel.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, Endpoint::new("127.0.0.1", 40123));
        assert_eq!(runs[0].1, 8080);
        assert_eq!(runs[0].2, Some(selector([("app", "phasing")])));

        assert_eq!(api.selector("default", "web"), Some(selector([("app", "web")])));
        assert_eq!(api.writes(), 2);
        assert_eq!(coordinator.phase(), Phase::Terminated);

        let session = coordinator.session().unwrap();
        assert_eq!(session.service_name, "web");
        assert_eq!(session.agent_port, 40123);
        assert_eq!(session.local_port, 7777);
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_leaves_cluster_untouched() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Hang, &shutdown, &api);
        let mut plan = plan("exec sleep 30", Some("web"));
        plan.bootstrap_timeout = Duration::from_millis(200);
        let mut coordinator = coordinator(&api, plan, tunnel.clone(), &shutdown);

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(
            err,
            PhasingError::ControlChannel(ControlChannelError::BootstrapTimeout(_))
        ));
        assert_eq!(api.replace_calls(), 0);
        assert!(tunnel.runs().is_empty());
        assert_eq!(coordinator.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_during_bootstrap_touches_nothing() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Hang, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan("exec sleep 30", Some("web")), tunnel.clone(), &shutdown);

        shutdown.cancel();
        coordinator.run().await.unwrap();

        assert_eq!(api.replace_calls(), 0);
        assert!(tunnel.runs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_service_fails_without_tunnel() {
        let api = Arc::new(InMemoryServices::new());
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Hang, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, Some("web")), tunnel.clone(), &shutdown);

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, PhasingError::Cluster(ClusterError::NotFound { .. })));
        assert!(tunnel.runs().is_empty());
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn test_tunnel_failure_still_restores() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Fail, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, Some("web")), tunnel, &shutdown);

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, PhasingError::Tunnel(TunnelError::ListenSetupFailed(_))));
        assert_eq!(api.selector("default", "web"), Some(selector([("app", "web")])));
    }

    #[tokio::test]
    async fn test_tunnel_end_restores_and_succeeds() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Finish, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, Some("web")), tunnel, &shutdown);

        coordinator.run().await.unwrap();

        assert_eq!(api.selector("default", "web"), Some(selector([("app", "web")])));
    }

    #[tokio::test]
    async fn test_control_channel_loss_ends_session() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Hang, &shutdown, &api);
        let script = "echo 'Forwarding from 127.0.0.1:40123 -> 22'; sleep 0.3; exit 1";
        let mut coordinator = coordinator(&api, plan(script, Some("web")), tunnel, &shutdown);

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(
            err,
            PhasingError::ControlChannel(ControlChannelError::ControlChannelLost(_))
        ));
        assert_eq!(api.selector("default", "web"), Some(selector([("app", "web")])));
    }

    #[tokio::test]
    async fn test_service_is_chosen_when_not_named() {
        let api = web_cluster();
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Interrupt, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, None), tunnel.clone(), &shutdown);

        coordinator.run().await.unwrap();

        assert_eq!(tunnel.runs().len(), 1);
        assert_eq!(coordinator.session().unwrap().service_name, "web");
    }

    #[tokio::test]
    async fn test_empty_namespace_is_a_selection_error() {
        let api = Arc::new(InMemoryServices::new());
        let shutdown = CancellationToken::new();
        let tunnel = FakeTunnel::new(Behavior::Hang, &shutdown, &api);
        let mut coordinator = coordinator(&api, plan(READY, None), tunnel, &shutdown);

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, PhasingError::Selection(_)));
        assert_eq!(api.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_restore_runs_once_across_paths() {
        let api = web_cluster();
        let redirector = Arc::new(ServiceRedirector::new(
            Arc::clone(&api),
            ServiceRedirectionState::new("default", "web", selector([("app", "phasing")])),
            BackoffConfig::default(),
        ));
        redirector.hijack().await.unwrap();

        let restorer = Restorer::new();
        restorer.attach(redirector);
        let signal_path = restorer.clone();

        let (a, b) = tokio::join!(restorer.restore_once(), signal_path.restore_once());
        assert!(a.is_ok() && b.is_ok());
        assert!(restorer.has_run());

        // One write for the hijack, one for the restore
        assert_eq!(api.writes(), 2);
        assert_eq!(api.selector("default", "web"), Some(selector([("app", "web")])));
    }

    #[tokio::test]
    async fn test_restore_without_redirector_is_a_no_op() {
        let restorer: Restorer<InMemoryServices> = Restorer::new();
        assert!(restorer.restore_once().await.is_ok());
        assert!(restorer.has_run());
    }
}
