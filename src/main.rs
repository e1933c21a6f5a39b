//! # Secret Injection Agent
//!
//! Binary bootstrap: parse flags, read the pod's annotations from the
//! downward-API file (with a pod-object API fallback), locate the vault
//! credential, and hand everything to the rotation loop — once for init
//! containers, forever for sidecars.
//!
//! ## Exit Codes
//!
//! - `0` — success, including graceful shutdown on SIGTERM/SIGINT
//! - `1` — fatal startup or first-resolution failure (missing locator
//!   config, unresolvable entries under fail-on-error, unreachable vault
//!   with nothing cached)
//! - `2` — command-line usage errors (from clap)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use secret_injection_agent::config;
use secret_injection_agent::constants::{
    DEFAULT_ANNOTATIONS_FILE, DEFAULT_CACHE_MAX_AGE_SECS, DEFAULT_OUTPUT_ROOT, DEFAULT_PROBE_PORT,
};
use secret_injection_agent::mirror::{PodIdentity, SecretMirror};
use secret_injection_agent::rotation::RotationLoop;
use secret_injection_agent::server::{start_server, ServerState};
use secret_injection_agent::vault::{locator, VaultClient};

/// Kubernetes init/sidecar agent that injects vault records into workload pods
#[derive(Debug, Parser)]
#[command(name = "secret-injection-agent", version, about, long_about = None)]
struct Args {
    /// Base URL of the records vault API
    #[arg(long, env = "VAULT_ADDR")]
    vault_addr: String,

    /// Downward-API file carrying the pod's annotations
    #[arg(long, env = "ANNOTATIONS_FILE", default_value = DEFAULT_ANNOTATIONS_FILE)]
    annotations_file: PathBuf,

    /// Namespace of the workload pod (defaults to the in-cluster namespace)
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: Option<String>,

    /// Pod name, for ownerReferences on mirrored secrets and the annotation
    /// API fallback
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Pod uid, for ownerReferences on mirrored secrets
    #[arg(long, env = "POD_UID")]
    pod_uid: Option<String>,

    /// Port for the /healthz and /readyz probe endpoints
    #[arg(long, env = "PROBE_PORT", default_value_t = DEFAULT_PROBE_PORT)]
    probe_port: u16,

    /// Maximum age in seconds a cached resolution may be served while the
    /// vault is unreachable
    #[arg(long, env = "CACHE_MAX_AGE", default_value_t = DEFAULT_CACHE_MAX_AGE_SECS)]
    cache_max_age: u64,

    /// Directory rendered secrets land in when entries use relative or
    /// defaulted paths
    #[arg(long, env = "OUTPUT_ROOT", default_value = DEFAULT_OUTPUT_ROOT)]
    output_root: PathBuf,

    /// Resolve once and exit, regardless of the init-only annotation
    #[arg(long)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secret_injection_agent=info".into()),
        )
        .init();

    // reqwest and kube share the process-wide TLS provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = env!("BUILD_DATETIME"),
        git = env!("BUILD_GIT_HASH"),
        "🚀 Starting secret-injection-agent"
    );

    // The client backs the k8s-secret locator, CA sources, mirroring, and
    // the annotation fallback. Out-of-cluster runs can still work against
    // cloud locators without it.
    let client = match Client::try_default().await {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(%err, "⚠️ No Kubernetes API access; k8s locator, CA sources, and mirroring are unavailable");
            None
        }
    };

    let namespace = args
        .namespace
        .clone()
        .or_else(|| client.as_ref().map(|c| c.default_namespace().to_string()))
        .unwrap_or_else(|| "default".to_string());

    let annotations = load_annotations(&args, client.as_ref(), &namespace).await?;
    let mut plan = config::parse_annotations(&annotations, &args.output_root)
        .context("invalid pod annotations")?;
    if plan.is_empty() {
        anyhow::bail!(
            "no injection annotations found under the agent prefix; nothing to do"
        );
    }
    if args.run_once {
        plan.init_only = true;
    }
    info!(
        secrets = plan.secrets.len(),
        folders = plan.folders.len(),
        init_only = plan.init_only,
        "📋 Parsed injection plan"
    );

    let ca_pem = match &plan.ca_cert {
        Some(source) => {
            Some(locator::load_ca_material(source, client.as_ref(), &namespace).await?)
        }
        None => None,
    };
    let credentials =
        locator::load_credentials(&plan.locator, &args.vault_addr, client.as_ref(), &namespace)
            .await?;
    let vault = VaultClient::new(credentials, ca_pem.as_deref())?;

    let identity = PodIdentity {
        name: args.pod_name.clone(),
        uid: args.pod_uid.clone(),
    };
    let mirror = client
        .as_ref()
        .map(|c| SecretMirror::new(c.clone(), &namespace, identity));

    let readiness = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("🛑 Shutdown signal received");
            cancel.cancel();
        });
    }

    // The probe server only matters for the long-running sidecar.
    if !plan.init_only {
        let state = Arc::new(ServerState {
            is_ready: Arc::clone(&readiness),
        });
        let server_cancel = cancel.clone();
        let port = args.probe_port;
        tokio::spawn(async move {
            if let Err(err) = start_server(port, state, server_cancel).await {
                error!("HTTP server error: {}", err);
            }
        });
    }

    let mut rotation = RotationLoop::new(
        plan,
        Box::new(vault),
        Duration::from_secs(args.cache_max_age),
        mirror,
        readiness,
        cancel.clone(),
    );

    rotation.run().await.context("secret resolution failed")?;

    info!("Agent stopped");
    Ok(())
}

/// Read the pod's annotations: the downward-API file first, the pod object
/// from the API when the file is not mounted.
async fn load_annotations(
    args: &Args,
    client: Option<&Client>,
    namespace: &str,
) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(&args.annotations_file) {
        Ok(content) => {
            debug!(
                file = %args.annotations_file.display(),
                "Reading annotations from the downward-API file"
            );
            Ok(config::parse_downward_annotations(&content)?)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let (Some(client), Some(pod_name)) = (client, args.pod_name.as_deref()) else {
                anyhow::bail!(
                    "annotations file {} not found and no pod identity for the API fallback",
                    args.annotations_file.display()
                );
            };
            info!(
                pod = pod_name,
                "Annotations file not mounted, reading pod annotations from the API"
            );
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            let pod = pods
                .get(pod_name)
                .await
                .with_context(|| format!("reading pod {namespace}/{pod_name}"))?;
            Ok(pod.metadata.annotations.unwrap_or_default())
        }
        Err(err) => Err(err).with_context(|| {
            format!(
                "reading annotations file {}",
                args.annotations_file.display()
            )
        }),
    }
}

/// Resolve on SIGTERM (kubelet) or SIGINT (local runs).
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handling available; park instead of busy-looping
            std::future::pending::<()>().await;
        }
    };
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                () = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => ctrl_c.await,
    }
}
