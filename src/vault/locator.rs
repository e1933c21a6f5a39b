//! # Credential location
//!
//! Resolves the vault API token before the first fetch. The token never
//! travels in annotations; annotations only say WHERE it lives, and this
//! module goes and gets it.
//!
//! ## Methods
//!
//! - Kubernetes Secret in the workload's namespace (default)
//! - AWS Secrets Manager through the SDK default credential chain (IRSA)
//! - GCP Secret Manager over REST with a Workload Identity metadata token
//! - Azure Key Vault over REST with a federated workload identity token
//!
//! The token is held in a [`VaultCredentials`] that zeroes its memory on
//! drop and redacts itself in Debug output.

use base64::{engine::general_purpose, Engine as _};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use serde::Deserialize;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{CaSource, LocatorConfig};
use crate::constants::VAULT_HTTP_TIMEOUT_SECS;
use crate::error::InjectionError;

/// Vault address plus the located API token.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultCredentials {
    #[zeroize(skip)]
    base_url: String,
    token: String,
}

impl std::fmt::Debug for VaultCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCredentials")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl VaultCredentials {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Fetch the vault token from wherever the locator points and pair it with
/// the vault address.
pub async fn load_credentials(
    locator: &LocatorConfig,
    vault_addr: &str,
    kube_client: Option<&kube::Client>,
    pod_namespace: &str,
) -> Result<VaultCredentials, InjectionError> {
    info!(method = locator.method(), "🔑 Locating vault credentials");
    let token = match locator {
        LocatorConfig::K8sSecret {
            name,
            namespace,
            key,
        } => {
            let client = kube_client.ok_or_else(|| {
                InjectionError::ConfigInvalid(
                    "k8s-secret locator needs in-cluster Kubernetes access".to_string(),
                )
            })?;
            let namespace = namespace.as_deref().unwrap_or(pod_namespace);
            read_k8s_secret_key(client, namespace, name, key).await?
        }
        LocatorConfig::AwsSecretsManager { secret_id, region } => {
            read_aws_secret(secret_id, region.as_deref()).await?
        }
        LocatorConfig::GcpSecretManager { project_id, secret } => {
            read_gcp_secret(project_id, secret).await?
        }
        LocatorConfig::AzureKeyVault { vault, secret } => {
            read_azure_secret(vault, secret).await?
        }
    };

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(InjectionError::ConfigInvalid(format!(
            "locator '{}' produced an empty token",
            locator.method()
        )));
    }
    Ok(VaultCredentials::new(vault_addr, token))
}

/// Load extra CA material for the vault TLS connection.
pub async fn load_ca_material(
    source: &CaSource,
    kube_client: Option<&kube::Client>,
    pod_namespace: &str,
) -> Result<Vec<u8>, InjectionError> {
    match source {
        CaSource::File { path } => std::fs::read(path).map_err(|e| {
            InjectionError::ConfigInvalid(format!("CA file {}: {e}", path.display()))
        }),
        CaSource::Secret { name, key } => {
            let client = require_kube(kube_client, "CA secret")?;
            let api: Api<Secret> = Api::namespaced(client.clone(), pod_namespace);
            let secret = api.get(name).await.map_err(not_found_as_config(format!(
                "CA secret '{pod_namespace}/{name}' not found"
            )))?;
            let data = secret.data.unwrap_or_default();
            data.get(key).map(|bytes| bytes.0.clone()).ok_or_else(|| {
                InjectionError::ConfigInvalid(format!(
                    "CA secret '{pod_namespace}/{name}' has no key '{key}'"
                ))
            })
        }
        CaSource::ConfigMap { name, key } => {
            let client = require_kube(kube_client, "CA configmap")?;
            let api: Api<ConfigMap> = Api::namespaced(client.clone(), pod_namespace);
            let configmap = api.get(name).await.map_err(not_found_as_config(format!(
                "CA configmap '{pod_namespace}/{name}' not found"
            )))?;
            if let Some(value) = configmap.data.as_ref().and_then(|d| d.get(key)) {
                return Ok(value.clone().into_bytes());
            }
            configmap
                .binary_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|bytes| bytes.0.clone())
                .ok_or_else(|| {
                    InjectionError::ConfigInvalid(format!(
                        "CA configmap '{pod_namespace}/{name}' has no key '{key}'"
                    ))
                })
        }
    }
}

fn require_kube<'c>(
    client: Option<&'c kube::Client>,
    what: &str,
) -> Result<&'c kube::Client, InjectionError> {
    client.ok_or_else(|| {
        InjectionError::ConfigInvalid(format!("{what} needs in-cluster Kubernetes access"))
    })
}

/// Turn a kube 404 into a config error; everything else passes through as a
/// Kubernetes API failure.
fn not_found_as_config(message: String) -> impl FnOnce(kube::Error) -> InjectionError {
    move |error| match &error {
        kube::Error::Api(response) if response.code == 404 => {
            InjectionError::ConfigInvalid(message)
        }
        _ => InjectionError::KubeApi(error),
    }
}

async fn read_k8s_secret_key(
    client: &kube::Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, InjectionError> {
    debug!(namespace, name, key, "Reading locator Secret");
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(name).await.map_err(not_found_as_config(format!(
        "locator secret '{namespace}/{name}' not found"
    )))?;
    let data = secret.data.unwrap_or_default();
    let bytes = data.get(key).ok_or_else(|| {
        InjectionError::ConfigInvalid(format!(
            "locator secret '{namespace}/{name}' has no key '{key}'"
        ))
    })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| {
        InjectionError::MalformedResponse(format!(
            "locator secret '{namespace}/{name}' key '{key}' is not UTF-8"
        ))
    })
}

async fn read_aws_secret(
    secret_id: &str,
    region: Option<&str>,
) -> Result<String, InjectionError> {
    let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        builder = builder.region(aws_config::Region::new(region.to_string()));
    }
    let sdk_config = builder.load().await;
    let client = aws_sdk_secretsmanager::Client::new(&sdk_config);

    let response = client
        .get_secret_value()
        .secret_id(secret_id)
        .send()
        .await
        .map_err(|e| {
            InjectionError::BackendUnavailable(format!("AWS Secrets Manager '{secret_id}': {e}"))
        })?;

    response
        .secret_string()
        .map(ToString::to_string)
        .or_else(|| {
            response
                .secret_binary()
                .map(|blob| String::from_utf8_lossy(blob.as_ref()).to_string())
        })
        .ok_or_else(|| {
            InjectionError::MalformedResponse(format!(
                "AWS secret '{secret_id}' has no string or binary value"
            ))
        })
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GcpAccessResponse {
    payload: GcpAccessPayload,
}

#[derive(Deserialize)]
struct GcpAccessPayload {
    data: String,
}

fn locator_http_client() -> Result<reqwest::Client, InjectionError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(VAULT_HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| InjectionError::BackendUnavailable(format!("http client init: {e}")))
}

/// Workload Identity: the GKE metadata server hands out a scoped OAuth2
/// token for the pod's bound service account.
async fn gcp_metadata_token(http: &reqwest::Client) -> Result<String, InjectionError> {
    let url =
        "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
    let response = http
        .get(url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| {
            InjectionError::BackendUnavailable(format!("GCP metadata server: {e}"))
        })?;
    if !response.status().is_success() {
        return Err(InjectionError::BackendUnavailable(format!(
            "GCP metadata server returned {}",
            response.status()
        )));
    }
    let token: MetadataTokenResponse = response.json().await.map_err(|e| {
        InjectionError::MalformedResponse(format!("GCP metadata token response: {e}"))
    })?;
    Ok(token.access_token)
}

async fn read_gcp_secret(project_id: &str, secret: &str) -> Result<String, InjectionError> {
    let http = locator_http_client()?;
    let access_token = gcp_metadata_token(&http).await?;

    let url = format!(
        "https://secretmanager.googleapis.com/v1/projects/{project_id}/secrets/{secret}/versions/latest:access"
    );
    let response = http
        .get(&url)
        .bearer_auth(&access_token)
        .send()
        .await
        .map_err(|e| InjectionError::BackendUnavailable(format!("GCP Secret Manager: {e}")))?;
    match response.status() {
        status if status.is_success() => {
            let access: GcpAccessResponse = response.json().await.map_err(|e| {
                InjectionError::MalformedResponse(format!("GCP secret response: {e}"))
            })?;
            let decoded = general_purpose::STANDARD
                .decode(access.payload.data.as_bytes())
                .map_err(|e| {
                    InjectionError::MalformedResponse(format!("GCP secret payload base64: {e}"))
                })?;
            String::from_utf8(decoded).map_err(|_| {
                InjectionError::MalformedResponse(format!(
                    "GCP secret '{secret}' is not UTF-8"
                ))
            })
        }
        reqwest::StatusCode::NOT_FOUND => Err(InjectionError::ConfigInvalid(format!(
            "GCP secret 'projects/{project_id}/secrets/{secret}' not found"
        ))),
        status => Err(InjectionError::BackendUnavailable(format!(
            "GCP Secret Manager returned {status}"
        ))),
    }
}

#[derive(Deserialize)]
struct AzureTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct AzureSecretResponse {
    value: String,
}

fn azure_env(name: &str) -> Result<String, InjectionError> {
    std::env::var(name).map_err(|_| {
        InjectionError::ConfigInvalid(format!(
            "azure-key-vault locator needs the {name} environment variable (workload identity webhook)"
        ))
    })
}

/// Workload identity: exchange the projected federated token for a vault
/// access token at the tenant's OAuth2 endpoint.
async fn azure_workload_token(http: &reqwest::Client) -> Result<String, InjectionError> {
    let token_file = azure_env("AZURE_FEDERATED_TOKEN_FILE")?;
    let client_id = azure_env("AZURE_CLIENT_ID")?;
    let tenant_id = azure_env("AZURE_TENANT_ID")?;

    let assertion = std::fs::read_to_string(&token_file).map_err(|e| {
        InjectionError::ConfigInvalid(format!("federated token file {token_file}: {e}"))
    })?;

    let url = format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token");
    let params = [
        ("grant_type", "client_credentials"),
        ("scope", "https://vault.azure.net/.default"),
        ("client_id", client_id.as_str()),
        (
            "client_assertion_type",
            "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
        ),
        ("client_assertion", assertion.trim()),
    ];
    let response = http.post(&url).form(&params).send().await.map_err(|e| {
        InjectionError::BackendUnavailable(format!("Azure token endpoint: {e}"))
    })?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(InjectionError::BackendUnavailable(format!(
            "Azure token endpoint returned {status}: {body}"
        )));
    }
    let token: AzureTokenResponse = response.json().await.map_err(|e| {
        InjectionError::MalformedResponse(format!("Azure token response: {e}"))
    })?;
    Ok(token.access_token)
}

async fn read_azure_secret(vault: &str, secret: &str) -> Result<String, InjectionError> {
    let http = locator_http_client()?;
    let access_token = azure_workload_token(&http).await?;

    let vault_url = if vault.starts_with("https://") {
        vault.trim_end_matches('/').to_string()
    } else {
        format!("https://{vault}.vault.azure.net")
    };
    let url = format!("{vault_url}/secrets/{secret}?api-version=7.4");
    let response = http
        .get(&url)
        .bearer_auth(&access_token)
        .send()
        .await
        .map_err(|e| InjectionError::BackendUnavailable(format!("Azure Key Vault: {e}")))?;
    match response.status() {
        status if status.is_success() => {
            let payload: AzureSecretResponse = response.json().await.map_err(|e| {
                InjectionError::MalformedResponse(format!("Azure secret response: {e}"))
            })?;
            Ok(payload.value)
        }
        reqwest::StatusCode::NOT_FOUND => Err(InjectionError::ConfigInvalid(format!(
            "Azure secret '{secret}' not found in vault '{vault}'"
        ))),
        status => Err(InjectionError::BackendUnavailable(format!(
            "Azure Key Vault returned {status}"
        ))),
    }
}
