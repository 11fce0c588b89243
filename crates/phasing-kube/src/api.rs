//! Access to Service objects in the cluster

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};

use phasing_core::error::ClusterError;

/// Connection timeout for the API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API requests
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The Service operations phasing needs from the cluster
#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// Fetch a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;

    /// Replace a Service. Fails with `ClusterError::Conflict` when the
    /// object's resourceVersion is stale.
    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    /// Names of all Services in a namespace
    async fn list_services(&self, namespace: &str) -> Result<Vec<String>, ClusterError>;
}

/// `ServiceApi` backed by a kube client
#[derive(Clone)]
pub struct KubeServiceApi {
    client: Client,
}

impl KubeServiceApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ServiceApi for KubeServiceApi {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.services(namespace)
            .get(name)
            .await
            .map_err(|e| cluster_error(e, namespace, name))
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = service.name_any();
        self.services(namespace)
            .replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| cluster_error(e, namespace, &name))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<String>, ClusterError> {
        let list = self
            .services(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Unreachable(e.to_string()))?;

        Ok(list.items.iter().map(|svc| svc.name_any()).collect())
    }
}

/// Map a kube error for the named Service onto the cluster error taxonomy
pub fn cluster_error(error: kube::Error, namespace: &str, name: &str) -> ClusterError {
    match error {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict {
            name: name.to_string(),
        },
        other => ClusterError::Unreachable(other.to_string()),
    }
}

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, ClusterError> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                ClusterError::Unreachable(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    ClusterError::Unreachable(format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer()
            .await
            .map_err(|e| ClusterError::Unreachable(format!("failed to infer config: {}", e)))?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| ClusterError::Unreachable(format!("failed to create client: {}", e)))
}
