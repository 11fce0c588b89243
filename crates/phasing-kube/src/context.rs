//! Namespace discovery from the kubeconfig

use std::path::Path;

use kube::config::Kubeconfig;

/// Namespace used when the current context does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace of the kubeconfig's current context, if it sets one.
///
/// Reads `path` when given, otherwise the usual `$KUBECONFIG` / `~/.kube/config`
/// lookup. An unreadable kubeconfig yields `None`.
pub fn current_namespace(path: Option<&Path>) -> Option<String> {
    let kubeconfig = match path {
        Some(path) => Kubeconfig::read_from(path),
        None => Kubeconfig::read(),
    };

    let kubeconfig = match kubeconfig {
        Ok(kubeconfig) => kubeconfig,
        Err(e) => {
            tracing::debug!("Could not read kubeconfig for namespace discovery: {}", e);
            return None;
        }
    };

    let current = kubeconfig.current_context.as_deref()?;
    kubeconfig
        .contexts
        .iter()
        .find(|named| named.name == current)
        .and_then(|named| named.context.as_ref())
        .and_then(|context| context.namespace.clone())
        .filter(|namespace| !namespace.is_empty())
}

/// Namespace to use: an explicit choice, then the current context, then `default`
pub fn resolve_namespace(explicit: Option<&str>, kubeconfig: Option<&Path>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| current_namespace(kubeconfig))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}
