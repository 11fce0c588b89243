//! In-memory `ServiceApi` with resourceVersion conflict detection
//!
//! Behaves like the API server for the handful of calls phasing makes: every
//! successful write bumps the resourceVersion and writes carrying a stale
//! version are rejected with a conflict. Used to exercise the redirection
//! and lifecycle logic without a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use phasing_core::error::ClusterError;
use phasing_core::Selector;

use crate::api::ServiceApi;

/// Build a Service with a selector and one port per entry in `ports`
pub fn new_service(name: &str, selector: Option<Selector>, ports: &[i32]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector,
            ports: Some(
                ports
                    .iter()
                    .map(|port| ServicePort {
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Default)]
struct Store {
    services: HashMap<(String, String), Service>,
    version: u64,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Services held in memory
#[derive(Default)]
pub struct InMemoryServices {
    store: Mutex<Store>,
    pending_conflicts: AtomicU32,
    replace_calls: AtomicU32,
    writes: AtomicU32,
}

impl InMemoryServices {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a Service without counting it as a write
    pub fn insert(&self, namespace: &str, mut service: Service) {
        let mut store = self.lock();
        service.metadata.resource_version = Some(store.next_version());
        service.metadata.namespace = Some(namespace.to_string());
        let key = (namespace.to_string(), service.name_any());
        store.services.insert(key, service);
    }

    /// Current copy of a Service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Current selector of a Service (`None` when unset or missing)
    pub fn selector(&self, namespace: &str, name: &str) -> Option<Selector> {
        self.service(namespace, name)
            .and_then(|svc| svc.spec)
            .and_then(|spec| spec.selector)
    }

    /// Modify a Service as another cluster actor would, bumping its version
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Service)) {
        let mut store = self.lock();
        let version = store.next_version();
        if let Some(service) = store
            .services
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            f(service);
            service.metadata.resource_version = Some(version);
        }
    }

    /// Make the next `count` replace calls lose a race against another writer
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of replace calls, successful or not
    pub fn replace_calls(&self) -> u32 {
        self.replace_calls.load(Ordering::SeqCst)
    }

    /// Number of successful writes
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // A panic while holding the lock only happens in a failing test
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ServiceApi for InMemoryServices {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.service(namespace, name)
            .ok_or_else(|| ClusterError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let name = service.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut store = self.lock();

        let current_version = match store.services.get(&key) {
            Some(current) => current.metadata.resource_version.clone(),
            None => {
                return Err(ClusterError::NotFound {
                    namespace: namespace.to_string(),
                    name,
                })
            }
        };

        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            let version = store.next_version();
            if let Some(current) = store.services.get_mut(&key) {
                current.metadata.resource_version = Some(version);
            }
            return Err(ClusterError::Conflict { name });
        }

        if service.metadata.resource_version != current_version {
            return Err(ClusterError::Conflict { name });
        }

        let mut stored = service.clone();
        stored.metadata.resource_version = Some(store.next_version());
        store.services.insert(key, stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<String>, ClusterError> {
        let mut names: Vec<String> = self
            .lock()
            .services
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasing_core::types::selector;

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let api = InMemoryServices::new();
        api.insert("default", new_service("web", Some(selector([("app", "web")])), &[8080]));

        let stale = api.get_service("default", "web").await.unwrap();
        api.modify("default", "web", |svc| {
            svc.metadata.labels = Some(selector([("rolled", "yes")]))
        });

        let err = api.replace_service("default", &stale).await.unwrap_err();
        assert_eq!(err, ClusterError::Conflict { name: "web".to_string() });
        assert_eq!(api.writes(), 0);

        let fresh = api.get_service("default", "web").await.unwrap();
        api.replace_service("default", &fresh).await.unwrap();
        assert_eq!(api.writes(), 1);
    }

    #[tokio::test]
    async fn test_list_is_namespaced_and_sorted() {
        let api = InMemoryServices::new();
        api.insert("default", new_service("web", None, &[80]));
        api.insert("default", new_service("api", None, &[80]));
        api.insert("other", new_service("db", None, &[5432]));

        assert_eq!(api.list_services("default").await.unwrap(), vec!["api", "web"]);
        assert!(api.list_services("empty").await.unwrap().is_empty());
    }
}
