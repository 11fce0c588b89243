//! One-time cluster setup (`phasing --init`)
//!
//! Generates the client key pair if it is missing, publishes the public key
//! as a Secret the agent mounts as its `authorized_keys`, and optionally
//! applies the agent manifest.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

/// Name of the Secret holding the authorized public key
pub const AUTHORIZED_KEYS_SECRET: &str = "phasing-authorized-keys";

/// Key inside the Secret
pub const AUTHORIZED_KEYS_ENTRY: &str = "authorized_keys";

/// Path of the public half of a key pair
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = OsString::from(private_key.as_os_str());
    path.push(".pub");
    PathBuf::from(path)
}

/// Ensure the SSH key pair exists, generate it if needed.
///
/// Returns `true` when a new key was generated.
pub async fn ensure_ssh_key(path: &Path) -> Result<bool> {
    if path.exists() {
        tracing::debug!("Using existing key {}", path.display());
        return Ok(false);
    }

    tracing::info!("Generating SSH key {}", path.display());

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let status = tokio::process::Command::new("ssh-keygen")
        .args([
            "-t",
            "ed25519",
            "-f",
            &path.to_string_lossy(),
            "-N",
            "",
            "-C",
            "phasing",
        ])
        .status()
        .await
        .context("Failed to run ssh-keygen")?;

    if !status.success() {
        anyhow::bail!("ssh-keygen failed");
    }

    Ok(true)
}

/// Read the public key that belongs to `private_key`
pub async fn read_public_key(private_key: &Path) -> Result<String> {
    let path = public_key_path(private_key);
    let key = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read public key {}", path.display()))?;
    Ok(key.trim().to_string())
}

/// Secret carrying `public_key` as the agent's authorized key
pub fn authorized_keys_secret(namespace: &str, public_key: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(AUTHORIZED_KEYS_ENTRY.to_string(), format!("{}\n", public_key));

    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/managed-by".to_string(), "phasing".to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(AUTHORIZED_KEYS_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    }
}

/// Create or replace the authorized keys Secret
pub async fn publish_authorized_key(client: &Client, namespace: &str, public_key: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let mut secret = authorized_keys_secret(namespace, public_key);

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            tracing::info!("Created Secret {}/{}", namespace, AUTHORIZED_KEYS_SECRET);
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let existing = secrets
                .get(AUTHORIZED_KEYS_SECRET)
                .await
                .with_context(|| format!("Failed to read Secret {}", AUTHORIZED_KEYS_SECRET))?;
            secret.metadata.resource_version = existing.metadata.resource_version;
            secrets
                .replace(AUTHORIZED_KEYS_SECRET, &PostParams::default(), &secret)
                .await
                .with_context(|| format!("Failed to update Secret {}", AUTHORIZED_KEYS_SECRET))?;
            tracing::info!("Updated Secret {}/{}", namespace, AUTHORIZED_KEYS_SECRET);
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to create Secret {}: {}",
                AUTHORIZED_KEYS_SECRET,
                e
            ))
        }
    }

    Ok(())
}

/// `kubectl apply -f <manifest>` in `namespace`
pub async fn apply_manifest(
    kubectl: &str,
    kubeconfig: Option<&Path>,
    namespace: &str,
    manifest: &Path,
) -> Result<()> {
    let mut command = tokio::process::Command::new(kubectl);
    if let Some(path) = kubeconfig {
        command.arg("--kubeconfig").arg(path);
    }
    command
        .args(["--namespace", namespace, "apply", "-f"])
        .arg(manifest);

    tracing::info!("Applying agent manifest {}", manifest.display());

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to run {}", kubectl))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} apply failed ({}): {}",
            kubectl,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_path_appends_suffix() {
        assert_eq!(
            public_key_path(Path::new("/home/me/.ssh/phasing_key")),
            PathBuf::from("/home/me/.ssh/phasing_key.pub")
        );
        assert_eq!(
            public_key_path(Path::new("keys/agent.key")),
            PathBuf::from("keys/agent.key.pub")
        );
    }

    #[test]
    fn test_secret_shape() {
        let secret = authorized_keys_secret("default", "ssh-ed25519 AAAA phasing");
        assert_eq!(secret.metadata.name.as_deref(), Some(AUTHORIZED_KEYS_SECRET));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        let data = secret.string_data.unwrap();
        assert_eq!(
            data.get(AUTHORIZED_KEYS_ENTRY).map(String::as_str),
            Some("ssh-ed25519 AAAA phasing\n")
        );
    }

    #[tokio::test]
    async fn test_existing_key_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("phasing_key");
        std::fs::write(&key, "existing").unwrap();

        assert!(!ensure_ssh_key(&key).await.unwrap());
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "existing");
    }

    #[tokio::test]
    async fn test_read_public_key_trims() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("phasing_key");
        std::fs::write(public_key_path(&key), "ssh-ed25519 AAAA phasing\n").unwrap();

        assert_eq!(read_public_key(&key).await.unwrap(), "ssh-ed25519 AAAA phasing");
        assert!(read_public_key(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_manifest_checks_exit_status() {
        let manifest = Path::new("agent.yaml");
        assert!(apply_manifest("true", None, "default", manifest).await.is_ok());
        assert!(apply_manifest("false", None, "default", manifest).await.is_err());
        assert!(apply_manifest("/nonexistent/kubectl", None, "default", manifest)
            .await
            .is_err());
    }
}
