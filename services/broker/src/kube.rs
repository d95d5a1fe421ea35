//! Kubernetes API server implementation of the workload store.
//!
//! Pods are listed with a `spec.nodeName` field selector and updated with a
//! JSON merge patch that carries `metadata.resourceVersion`, so the API server
//! rejects the write with 409 when the pod changed since it was read.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::store::{StoreError, WorkloadStore};
use crate::workload::{Workload, WorkloadKey, WorkloadList};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Kubernetes API client.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Create a client from the broker configuration, using service-account
    /// credentials when they are mounted.
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.store_timeout_secs));

        match std::fs::read(&config.kube_ca_path) {
            Ok(pem) => {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
            Err(e) => warn!(
                path = %config.kube_ca_path.display(),
                error = %e,
                "No API server CA bundle, using system roots"
            ),
        }

        let token = match std::fs::read_to_string(&config.kube_token_path) {
            Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(
                    path = %config.kube_token_path.display(),
                    error = %e,
                    "No service account token, sending unauthenticated requests"
                );
                None
            }
        };

        let client = builder.build()?;
        Self::from_parts(client, &config.kube_api_url, token)
    }

    /// Create a client for an explicit API server URL.
    pub fn with_base_url(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Self::from_parts(client, base_url, token)
    }

    fn from_parts(
        client: reqwest::Client,
        base_url: &str,
        token: Option<String>,
    ) -> Result<Self, StoreError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(StoreError::Config("empty API server URL".to_string()));
        }

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        )
    }
}

#[async_trait]
impl WorkloadStore for KubeClient {
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<Workload>, StoreError> {
        let url = format!("{}/api/v1/pods", self.base_url);
        let selector = format!("spec.nodeName={node_name}");
        debug!(url = %url, field_selector = %selector, "Listing pods");

        let response = self
            .request(Method::GET, &url)
            .query(&[("fieldSelector", selector.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let err = api_error(response).await;
            error!(error = %err, "Failed to list pods");
            return Err(err);
        }

        let list: WorkloadList = serde_json::from_slice(&response.bytes().await?)?;
        debug!(pod_count = list.items.len(), "Listed pods");
        Ok(list.items)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, StoreError> {
        let key = WorkloadKey::new(namespace, name);
        let response = self
            .request(Method::GET, &self.pod_url(namespace, name))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(workload_error(response, key).await);
        }

        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let key = workload.key();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": workload.metadata.resource_version,
                "annotations": workload.metadata.annotations,
            }
        });
        debug!(
            workload = %key,
            resource_version = ?workload.metadata.resource_version,
            "Patching pod annotations"
        );

        let response = self
            .request(Method::PATCH, &self.pod_url(&key.namespace, &key.name))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .json(&patch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(workload_error(response, key).await);
        }

        Ok(())
    }
}

/// `Status` object returned by the API server on failure.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

async fn workload_error(response: Response, key: WorkloadKey) -> StoreError {
    match response.status() {
        StatusCode::CONFLICT => StoreError::Conflict(key),
        StatusCode::NOT_FOUND => StoreError::NotFound(key),
        _ => api_error(response).await,
    }
}

async fn api_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiStatus>(&body) {
        Ok(api_status) if !api_status.message.is_empty() => api_status.message,
        _ => body,
    };
    StoreError::Api { status, message }
}
