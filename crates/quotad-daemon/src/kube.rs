//! In-cluster Kubernetes REST client.
//!
//! Speaks plain JSON to the API server over HTTPS, authenticating with the
//! pod's service account. Only the handful of PersistentVolume and
//! PersistentVolumeClaim calls the agent needs are implemented; responses are
//! decoded into narrow `serde` views and converted to the core model.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use quotad_core::model::{
    Claim, ClaimPatch, ClaimPhase, ClaimRef, HOSTNAME_LABEL, QUOTA_ANNOTATION, Volume,
    VolumePatch, VolumePhase, VolumeSpec,
};
use quotad_core::orchestrator::{OrchestratorClient, OrchestratorError};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

/// Directory the service account credentials are mounted at.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Upper bound on a single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PERSISTENT_VOLUME: &str = "PersistentVolume";
const PERSISTENT_VOLUME_CLAIM: &str = "PersistentVolumeClaim";

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Errors constructing a [`KubeClient`].
#[derive(Debug, Error)]
pub enum KubeClientError {
    /// Not running inside a cluster.
    #[error("environment variable {0} is not set; not running in a cluster?")]
    MissingEnv(&'static str),

    /// A credential file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The cluster CA bundle is unusable.
    #[error("invalid cluster CA certificate: {0}")]
    Certificate(String),
}

/// Where the bearer token comes from.
#[derive(Debug, Clone)]
pub enum BearerToken {
    /// A fixed token.
    Static(String),
    /// A token file, re-read on every request so rotated tokens are picked
    /// up.
    File(PathBuf),
}

/// Connection parameters of a [`KubeClient`].
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL, e.g. `https://10.0.0.1:443`.
    pub server: String,
    /// Bearer token source.
    pub token: BearerToken,
    /// PEM bundle of the cluster CA.
    pub ca_pem: Vec<u8>,
}

impl KubeConfig {
    /// Configuration of a pod running inside the cluster.
    pub fn in_cluster() -> Result<Self, KubeClientError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeClientError::MissingEnv("KUBERNETES_SERVICE_HOST"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| KubeClientError::MissingEnv("KUBERNETES_SERVICE_PORT"))?;
        Self::from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Configuration for the API server at `host:port` using the service
    /// account credentials mounted in `dir`.
    pub fn from_service_account(host: &str, port: &str, dir: &Path) -> Result<Self, KubeClientError> {
        let ca_path = dir.join("ca.crt");
        let ca_pem = std::fs::read(&ca_path).map_err(|source| KubeClientError::Io {
            path: ca_path,
            source,
        })?;

        let token_path = dir.join("token");
        std::fs::metadata(&token_path).map_err(|source| KubeClientError::Io {
            path: token_path.clone(),
            source,
        })?;

        Ok(Self {
            server: server_url(host, port),
            token: BearerToken::File(token_path),
            ca_pem,
        })
    }
}

fn server_url(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// Kubernetes implementation of [`OrchestratorClient`].
#[derive(Clone)]
pub struct KubeClient {
    server: String,
    token: BearerToken,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    /// Builds a client that trusts only the cluster CA.
    pub fn new(config: KubeConfig) -> Result<Self, KubeClientError> {
        let certs = CertificateDer::pem_slice_iter(&config.ca_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KubeClientError::Certificate(format!("failed to parse: {e}")))?;
        if certs.is_empty() {
            return Err(KubeClientError::Certificate(
                "no certificates in CA bundle".to_string(),
            ));
        }

        let mut root_store = RootCertStore::empty();
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| KubeClientError::Certificate(format!("failed to add: {e}")))?;
        }

        let tls = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| KubeClientError::Certificate(format!("TLS config error: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_http1()
            .build();

        Ok(Self {
            server: config.server.trim_end_matches('/').to_string(),
            token: config.token,
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    async fn bearer_token(&self) -> Result<String, OrchestratorError> {
        match &self.token {
            BearerToken::Static(token) => Ok(token.clone()),
            BearerToken::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|token| token.trim().to_string())
                .map_err(|e| {
                    OrchestratorError::Transport(format!(
                        "failed to read token {}: {e}",
                        path.display()
                    ))
                }),
        }
    }

    /// Sends one request and returns the status and body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), OrchestratorError> {
        let url = format!("{}{path}", self.server);
        let operation = format!("{method} {path}");
        let token = self.bearer_token().await?;

        let request = Request::builder()
            .method(method)
            .uri(&url)
            .header("Accept", "application/json")
            .header("Content-Type", content_type)
            .header("User-Agent", concat!("quotad/", env!("CARGO_PKG_VERSION")))
            .header("Authorization", format!("Bearer {token}"))
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        debug!(%operation, "sending API request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e: hyper_util::client::legacy::Error| {
                    OrchestratorError::Transport(e.to_string())
                })?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| OrchestratorError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, OrchestratorError>((status, body))
        };

        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| OrchestratorError::Transport(format!("{operation} timed out")))?
    }

    /// Sends a request and maps non-success statuses to errors.
    async fn call(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Option<Value>,
        kind: &'static str,
        name: &str,
    ) -> Result<Bytes, OrchestratorError> {
        let operation = format!("{method} {path}");
        let body = body
            .map(|value| serde_json::to_vec(&value))
            .transpose()
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        let (status, bytes) = self.send(method, path, content_type, body).await?;
        if status.is_success() {
            return Ok(bytes);
        }

        match status {
            StatusCode::NOT_FOUND => Err(OrchestratorError::NotFound {
                kind,
                name: name.to_string(),
            }),
            StatusCode::CONFLICT => Err(OrchestratorError::AlreadyExists {
                kind,
                name: name.to_string(),
            }),
            _ => Err(OrchestratorError::Status {
                status: status.as_u16(),
                operation,
                message: status_message(&bytes),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        name: &str,
    ) -> Result<T, OrchestratorError> {
        let bytes = self
            .call(Method::GET, path, "application/json", None, kind, name)
            .await?;
        decode(path, &bytes)
    }
}

/// Extracts `message` from a `Status` body, falling back to the raw text.
fn status_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Status {
        message: String,
    }

    serde_json::from_slice::<Status>(body)
        .map(|status| status.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, OrchestratorError> {
    serde_json::from_slice(body).map_err(|e| OrchestratorError::Decode {
        operation: path.to_string(),
        message: e.to_string(),
    })
}

/// Path listing the volumes that carry the label `label_key=label_value`.
fn volume_list_path(label_key: &str, label_value: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("labelSelector", &format!("{label_key}={label_value}"))
        .finish();
    format!("/api/v1/persistentvolumes?{query}")
}

#[async_trait]
impl OrchestratorClient for KubeClient {
    async fn list_volumes(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Volume>, OrchestratorError> {
        let path = volume_list_path(label_key, label_value);
        let list: ObjectList<PersistentVolume> =
            self.get_json(&path, PERSISTENT_VOLUME, "").await?;
        Ok(list.items.into_iter().map(Volume::from).collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Volume, OrchestratorError> {
        let path = format!("/api/v1/persistentvolumes/{name}");
        let volume: PersistentVolume = self.get_json(&path, PERSISTENT_VOLUME, name).await?;
        Ok(volume.into())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, OrchestratorError> {
        let path = "/api/v1/persistentvolumes";
        let bytes = self
            .call(
                Method::POST,
                path,
                "application/json",
                Some(volume_manifest(spec)),
                PERSISTENT_VOLUME,
                &spec.name,
            )
            .await?;
        let volume: PersistentVolume = decode(path, &bytes)?;
        Ok(volume.into())
    }

    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<(), OrchestratorError> {
        let path = format!("/api/v1/persistentvolumes/{name}");
        self.call(
            Method::PATCH,
            &path,
            MERGE_PATCH,
            Some(volume_patch_body(patch)),
            PERSISTENT_VOLUME,
            name,
        )
        .await
        .map(drop)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Claim, OrchestratorError> {
        let path = format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims/{name}");
        let claim: PersistentVolumeClaim = self
            .get_json(&path, PERSISTENT_VOLUME_CLAIM, &format!("{namespace}/{name}"))
            .await?;
        Ok(claim.into())
    }

    async fn list_claims(&self) -> Result<Vec<Claim>, OrchestratorError> {
        let list: ObjectList<PersistentVolumeClaim> = self
            .get_json("/api/v1/persistentvolumeclaims", PERSISTENT_VOLUME_CLAIM, "")
            .await?;
        Ok(list.items.into_iter().map(Claim::from).collect())
    }

    async fn patch_claim(
        &self,
        namespace: &str,
        name: &str,
        patch: &ClaimPatch,
    ) -> Result<(), OrchestratorError> {
        let path = format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims/{name}");
        self.call(
            Method::PATCH,
            &path,
            MERGE_PATCH,
            Some(claim_patch_body(patch)),
            PERSISTENT_VOLUME_CLAIM,
            &format!("{namespace}/{name}"),
        )
        .await
        .map(drop)
    }
}

// =============================================================================
// Request bodies
// =============================================================================

fn volume_manifest(spec: &VolumeSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": PERSISTENT_VOLUME,
        "metadata": {
            "name": spec.name,
            "labels": spec.labels,
        },
        "spec": {
            "capacity": { "storage": spec.capacity },
            "accessModes": spec.access_modes,
            "persistentVolumeReclaimPolicy": spec.reclaim_policy,
            "volumeMode": spec.volume_mode,
            "storageClassName": spec.storage_class,
            "local": { "path": spec.local_path.to_string_lossy() },
            "nodeAffinity": {
                "required": {
                    "nodeSelectorTerms": [{
                        "matchExpressions": [{
                            "key": HOSTNAME_LABEL,
                            "operator": "In",
                            "values": [spec.node_affinity],
                        }],
                    }],
                },
            },
        },
    })
}

fn volume_patch_body(patch: &VolumePatch) -> Value {
    match patch {
        VolumePatch::ClearClaimRef => json!({ "spec": { "claimRef": null } }),
    }
}

fn claim_patch_body(patch: &ClaimPatch) -> Value {
    match patch {
        ClaimPatch::SetQuotaAnnotation(quota) => json!({
            "metadata": { "annotations": { QUOTA_ANNOTATION: quota } }
        }),
    }
}

// =============================================================================
// Response views
// =============================================================================

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    resource_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct Phase {
    #[serde(default)]
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PersistentVolume {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PersistentVolumeSpec,
    #[serde(default)]
    status: Phase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistentVolumeSpec {
    #[serde(default)]
    capacity: BTreeMap<String, String>,
    #[serde(default)]
    claim_ref: Option<ObjectReference>,
    #[serde(default)]
    local: Option<LocalVolumeSource>,
    #[serde(default)]
    storage_class_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LocalVolumeSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PersistentVolumeClaim {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PersistentVolumeClaimSpec,
    #[serde(default)]
    status: Phase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistentVolumeClaimSpec {
    #[serde(default)]
    storage_class_name: Option<String>,
    #[serde(default)]
    volume_name: Option<String>,
    #[serde(default)]
    resources: ResourceRequirements,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceRequirements {
    #[serde(default)]
    requests: BTreeMap<String, String>,
}

impl From<PersistentVolume> for Volume {
    fn from(pv: PersistentVolume) -> Self {
        let phase = pv.status.phase.as_deref().map_or(VolumePhase::Pending, |p| {
            VolumePhase::from_api(p).unwrap_or_else(|| {
                warn!(volume = %pv.metadata.name, phase = p, "unknown volume phase");
                VolumePhase::Pending
            })
        });

        Self {
            phase,
            capacity: pv.spec.capacity.get("storage").cloned().unwrap_or_default(),
            claim_ref: pv.spec.claim_ref.map(|r| ClaimRef {
                namespace: r.namespace,
                name: r.name,
            }),
            local_path: pv.spec.local.map(|local| local.path),
            storage_class: pv.spec.storage_class_name,
            name: pv.metadata.name,
            labels: pv.metadata.labels,
        }
    }
}

impl From<PersistentVolumeClaim> for Claim {
    fn from(pvc: PersistentVolumeClaim) -> Self {
        let phase = pvc
            .status
            .phase
            .as_deref()
            .and_then(ClaimPhase::from_api)
            .unwrap_or_default();

        Self {
            namespace: pvc.metadata.namespace,
            name: pvc.metadata.name,
            storage_class: pvc.spec.storage_class_name,
            phase,
            volume_name: pvc.spec.volume_name.filter(|name| !name.is_empty()),
            requested_storage: pvc.spec.resources.requests.get("storage").cloned(),
            annotations: pvc.metadata.annotations,
            resource_version: pvc.metadata.resource_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use quotad_core::model::NODE_LABEL_KEY;

    use super::*;

    #[test]
    fn test_volume_from_api() {
        let pv: PersistentVolume = serde_json::from_value(json!({
            "metadata": {
                "name": "node-a-3",
                "labels": { "quotad-node": "node-a" },
                "resourceVersion": "812"
            },
            "spec": {
                "capacity": { "storage": "1000Gi" },
                "claimRef": { "namespace": "apps", "name": "data", "uid": "x" },
                "local": { "path": "/data/3" },
                "storageClassName": "local-storage"
            },
            "status": { "phase": "Released" }
        }))
        .unwrap();

        let volume = Volume::from(pv);

        assert_eq!(volume.name, "node-a-3");
        assert_eq!(volume.phase, VolumePhase::Released);
        assert_eq!(volume.capacity, "1000Gi");
        assert_eq!(
            volume.claim_ref,
            Some(ClaimRef {
                namespace: "apps".to_string(),
                name: "data".to_string()
            })
        );
        assert_eq!(volume.project_id(), Some(3));
        assert_eq!(volume.labels.get(NODE_LABEL_KEY).map(String::as_str), Some("node-a"));
    }

    #[test]
    fn test_volume_without_status_is_pending() {
        let pv: PersistentVolume =
            serde_json::from_value(json!({ "metadata": { "name": "x" } })).unwrap();
        assert_eq!(Volume::from(pv).phase, VolumePhase::Pending);
    }

    #[test]
    fn test_claim_from_api() {
        let pvc: PersistentVolumeClaim = serde_json::from_value(json!({
            "metadata": {
                "namespace": "apps",
                "name": "data",
                "annotations": { "quota": "10Gi" },
                "resourceVersion": "99"
            },
            "spec": {
                "storageClassName": "local-storage",
                "volumeName": "node-a-3",
                "resources": { "requests": { "storage": "10Gi" } }
            },
            "status": { "phase": "Bound" }
        }))
        .unwrap();

        let claim = Claim::from(pvc);

        assert_eq!(claim.phase, ClaimPhase::Bound);
        assert_eq!(claim.volume_name.as_deref(), Some("node-a-3"));
        assert_eq!(claim.requested_storage.as_deref(), Some("10Gi"));
        assert_eq!(claim.quota_annotation(), Some("10Gi"));
        assert_eq!(claim.resource_version, "99");
    }

    #[test]
    fn test_volume_manifest() {
        let spec = VolumeSpec::for_slot(
            "node-a",
            3,
            Path::new("/data/3"),
            "1000Gi",
            "local-storage",
        );

        let manifest = volume_manifest(&spec);

        assert_eq!(manifest["metadata"]["name"], "node-a-3");
        assert_eq!(manifest["metadata"]["labels"]["quotad-node"], "node-a");
        assert_eq!(manifest["spec"]["capacity"]["storage"], "1000Gi");
        assert_eq!(manifest["spec"]["accessModes"][0], "ReadWriteOnce");
        assert_eq!(manifest["spec"]["persistentVolumeReclaimPolicy"], "Retain");
        assert_eq!(manifest["spec"]["volumeMode"], "Filesystem");
        assert_eq!(manifest["spec"]["local"]["path"], "/data/3");
        let term = &manifest["spec"]["nodeAffinity"]["required"]["nodeSelectorTerms"][0];
        assert_eq!(term["matchExpressions"][0]["key"], "kubernetes.io/hostname");
        assert_eq!(term["matchExpressions"][0]["values"][0], "node-a");
    }

    #[test]
    fn test_patch_bodies() {
        assert_eq!(
            volume_patch_body(&VolumePatch::ClearClaimRef),
            json!({ "spec": { "claimRef": null } })
        );
        assert_eq!(
            claim_patch_body(&ClaimPatch::SetQuotaAnnotation("10Gi".to_string())),
            json!({ "metadata": { "annotations": { "quota": "10Gi" } } })
        );
    }

    #[test]
    fn test_status_message() {
        assert_eq!(
            status_message(br#"{"kind":"Status","message":"forbidden: nope"}"#),
            "forbidden: nope"
        );
        assert_eq!(status_message(b"plain"), "plain");
    }

    #[test]
    fn test_volume_list_path() {
        assert_eq!(
            volume_list_path("quotad-node", "node-a"),
            "/api/v1/persistentvolumes?labelSelector=quotad-node%3Dnode-a"
        );
        assert_eq!(
            volume_list_path("a b", "c/d&e"),
            "/api/v1/persistentvolumes?labelSelector=a+b%3Dc%2Fd%26e"
        );
    }

    #[test]
    fn test_server_url() {
        assert_eq!(server_url("10.0.0.1", "443"), "https://10.0.0.1:443");
        assert_eq!(server_url("fd00::1", "443"), "https://[fd00::1]:443");
    }

    #[test]
    fn test_client_rejects_empty_ca_bundle() {
        let config = KubeConfig {
            server: "https://10.0.0.1:443".to_string(),
            token: BearerToken::Static("t".to_string()),
            ca_pem: Vec::new(),
        };
        assert!(matches!(
            KubeClient::new(config),
            Err(KubeClientError::Certificate(_))
        ));
    }

    #[test]
    fn test_service_account_files_required() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            KubeConfig::from_service_account("10.0.0.1", "443", dir.path()),
            Err(KubeClientError::Io { .. })
        ));
    }
}
