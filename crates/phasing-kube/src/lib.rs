//! phasing-kube: the cluster side of phasing
//!
//! - [`redirector`]: swaps a Service's selector to the agent and back
//! - [`bootstrap`]: `kubectl port-forward` control channel to the agent pod
//! - [`api`]: the Service operations used, behind a trait
//! - [`memory`]: in-memory implementation of that trait
//! - [`context`]: namespace discovery from the kubeconfig
//! - [`init`]: key generation and agent setup

pub mod api;
pub mod bootstrap;
pub mod context;
pub mod init;
pub mod memory;
pub mod redirector;
pub mod retry;

pub use api::{create_client, KubeServiceApi, ServiceApi};
pub use bootstrap::{ControlChannel, ForwardCommand};
pub use context::resolve_namespace;
pub use memory::InMemoryServices;
pub use redirector::{RedirectionStatus, ServiceRedirectionState, ServiceRedirector};
pub use retry::retry_on_conflict;
