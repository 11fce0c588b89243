//! `phasing --init`

use std::path::PathBuf;

use anyhow::Result;

use phasing_core::config::PhasingConfig;
use phasing_kube::init::{
    apply_manifest, ensure_ssh_key, publish_authorized_key, read_public_key, AUTHORIZED_KEYS_SECRET,
};
use phasing_kube::{create_client, resolve_namespace};

use crate::output::{print_info, print_success};

/// Prepare the cluster for phasing sessions
pub async fn run_init(config: &PhasingConfig, kubeconfig: Option<PathBuf>) -> Result<()> {
    let namespace = config
        .agent_namespace
        .clone()
        .unwrap_or_else(|| resolve_namespace(config.namespace.as_deref(), kubeconfig.as_deref()));

    let key_path = &config.private_key_path;
    if ensure_ssh_key(key_path).await? {
        print_success(&format!("Generated SSH key {}", key_path.display()));
    } else {
        print_info(&format!("Using existing SSH key {}", key_path.display()));
    }

    let public_key = read_public_key(key_path).await?;
    let client = create_client(kubeconfig.as_deref()).await?;
    publish_authorized_key(&client, &namespace, &public_key).await?;
    print_success(&format!(
        "Published public key as Secret {}/{}",
        namespace, AUTHORIZED_KEYS_SECRET
    ));

    match &config.agent_manifest {
        Some(manifest) => {
            apply_manifest(&config.kubectl, kubeconfig.as_deref(), &namespace, manifest).await?;
            print_success(&format!("Applied agent manifest {}", manifest.display()));
        }
        None => {
            print_info(&format!(
                "No agent_manifest configured. Deploy a pod named '{}' in namespace {} that \
                 mounts Secret {} and carries the redirect labels.",
                config.agent_pod, namespace, AUTHORIZED_KEYS_SECRET
            ));
        }
    }

    Ok(())
}
