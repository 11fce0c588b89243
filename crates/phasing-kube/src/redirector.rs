//! Service selector hijacking and restoration
//!
//! The redirector swaps a Service's selector for one that matches the agent
//! pod, so cluster traffic for the Service lands on the agent, and later puts
//! the original selector back.
//!
//! # Capturing the original selector
//!
//! The selector seen by the first successful hijack is the only one ever
//! restored. Later hijacks re-apply the redirect selector without reading a
//! new "original", and restore is a no-op until a hijack has succeeded.
//!
//! The original is also stored on the Service under
//! [`ORIGINAL_SELECTOR_ANNOTATION`]. If a previous run died before restoring,
//! the next hijack finds the annotation and captures that selector instead of
//! the (already hijacked) live one, so restoring still brings back the
//! Service's real selector.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tokio::sync::Mutex;

use phasing_core::config::BackoffConfig;
use phasing_core::error::ClusterError;
use phasing_core::types::{format_selector, Selector};

use crate::api::ServiceApi;
use crate::retry::retry_on_conflict;

/// Annotation holding the JSON-encoded original selector while redirected
pub const ORIGINAL_SELECTOR_ANNOTATION: &str = "phasing.dev/original-selector";

/// Where a redirection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionStatus {
    /// No hijack has succeeded yet
    Pending,
    /// The Service points at the agent
    Hijacked,
    /// The original selector is back
    Restored,
}

/// Everything known about the redirection of one Service
#[derive(Debug, Clone)]
pub struct ServiceRedirectionState {
    /// Namespace of the Service
    pub namespace: String,
    /// Name of the Service
    pub service_name: String,
    /// Selector written while redirected
    pub redirect_selector: Selector,
    /// `Some` once captured; the inner `None` means the Service had no selector
    original_selector: Option<Option<Selector>>,
    /// First declared port of the Service, captured with the selector
    port: Option<u16>,
    /// Current status
    status: RedirectionStatus,
}

impl ServiceRedirectionState {
    /// Fresh state for a Service that has not been touched yet
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        redirect_selector: Selector,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            redirect_selector,
            original_selector: None,
            port: None,
            status: RedirectionStatus::Pending,
        }
    }

    /// Captured original selector: `None` before the first hijack,
    /// `Some(None)` if the Service had no selector
    pub fn original_selector(&self) -> Option<Option<&Selector>> {
        self.original_selector.as_ref().map(Option::as_ref)
    }

    /// Service port captured by the first hijack
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Current status
    pub fn status(&self) -> RedirectionStatus {
        self.status
    }

    /// Record the original selector and port. Only the first call has any effect.
    fn capture(&mut self, original: Option<Selector>, port: u16) {
        if self.original_selector.is_none() {
            self.original_selector = Some(original);
            self.port = Some(port);
        }
    }
}

/// Hijacks and restores one Service
pub struct ServiceRedirector<A: ServiceApi + ?Sized> {
    /// Cluster access
    api: Arc<A>,
    /// Redirection state; held for the whole of each operation
    state: Mutex<ServiceRedirectionState>,
    /// Retry policy for conflicting writes
    retry: BackoffConfig,
}

impl<A: ServiceApi + ?Sized> ServiceRedirector<A> {
    /// Create a redirector for the Service described by `state`
    pub fn new(api: Arc<A>, state: ServiceRedirectionState, retry: BackoffConfig) -> Self {
        Self {
            api,
            state: Mutex::new(state),
            retry,
        }
    }

    /// Snapshot of the current state
    pub async fn state(&self) -> ServiceRedirectionState {
        self.state.lock().await.clone()
    }

    /// Point the Service at the agent and return the Service's port.
    pub async fn hijack(&self) -> Result<u16, ClusterError> {
        let mut state = self.state.lock().await;

        let api = self.api.as_ref();
        let namespace = state.namespace.clone();
        let name = state.service_name.clone();
        let redirect = state.redirect_selector.clone();
        let captured = state.original_selector.clone();
        let (namespace, name, redirect, captured) = (&namespace, &name, &redirect, &captured);

        let (original, port) = retry_on_conflict(&self.retry, name, move || async move {
            let mut service = api.get_service(namespace, name).await?;
            let port = first_port(&service, namespace, name)?;

            let original = match captured {
                Some(original) => original.clone(),
                None => original_from_live(&service, name)?,
            };

            let annotation = serde_json::to_string(&original).map_err(|e| {
                ClusterError::InvalidAnnotation {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
            service
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ORIGINAL_SELECTOR_ANNOTATION.to_string(), annotation);
            service.spec.get_or_insert_with(Default::default).selector = Some(redirect.clone());

            api.replace_service(namespace, &service).await?;
            Ok((original, port))
        })
        .await?;

        state.capture(original, port);
        state.status = RedirectionStatus::Hijacked;

        tracing::info!(
            "Service {} in namespace {} redirected: {} -> {}",
            state.service_name,
            state.namespace,
            format_selector(state.original_selector().flatten()),
            format_selector(Some(&state.redirect_selector))
        );

        Ok(state.port.unwrap_or(port))
    }

    /// Put the original selector back.
    ///
    /// Does nothing (and issues no API calls) unless a hijack succeeded and
    /// the Service has not been restored yet.
    pub async fn restore(&self) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;

        match state.status {
            RedirectionStatus::Pending => {
                tracing::debug!(
                    "Service {} was never redirected, nothing to restore",
                    state.service_name
                );
                return Ok(());
            }
            RedirectionStatus::Restored => {
                tracing::debug!("Service {} already restored", state.service_name);
                return Ok(());
            }
            RedirectionStatus::Hijacked => {}
        }

        let Some(original) = state.original_selector.clone() else {
            return Ok(());
        };

        let api = self.api.as_ref();
        let namespace = state.namespace.clone();
        let name = state.service_name.clone();
        let (namespace, name, original) = (&namespace, &name, &original);

        retry_on_conflict(&self.retry, name, move || async move {
            let mut service = api.get_service(namespace, name).await?;

            if let Some(annotations) = service.metadata.annotations.as_mut() {
                annotations.remove(ORIGINAL_SELECTOR_ANNOTATION);
            }
            service.spec.get_or_insert_with(Default::default).selector = original.clone();

            api.replace_service(namespace, &service).await?;
            Ok(())
        })
        .await?;

        state.status = RedirectionStatus::Restored;

        tracing::info!(
            "Service {} in namespace {} restored: {}",
            state.service_name,
            state.namespace,
            format_selector(original.as_ref())
        );

        Ok(())
    }
}

/// First declared port of a Service
fn first_port(service: &Service, namespace: &str, name: &str) -> Result<u16, ClusterError> {
    let no_ports = || ClusterError::NoPorts {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };

    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .ok_or_else(no_ports)?
        .port;

    u16::try_from(port).map_err(|_| no_ports())
}

/// Selector to capture from a Service that has not been hijacked by this process
fn original_from_live(service: &Service, name: &str) -> Result<Option<Selector>, ClusterError> {
    let annotation = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ORIGINAL_SELECTOR_ANNOTATION));

    match annotation {
        Some(value) => {
            let recovered: Option<Selector> =
                serde_json::from_str(value).map_err(|e| ClusterError::InvalidAnnotation {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
            tracing::warn!(
                "Service {} is still redirected by an earlier run, recovering its original selector {}",
                name,
                format_selector(recovered.as_ref())
            );
            Ok(recovered)
        }
        None => Ok(service.spec.as_ref().and_then(|spec| spec.selector.clone())),
    }
}
