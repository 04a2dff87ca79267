use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use beacon_core::error::SyncError;
use beacon_core::trace::Capture;
use beacon_resolve::parameterize;
use reqwest::{Client, StatusCode};
use tracing::{error, info, warn};

use crate::types::*;

/// Per-call timeout for every outbound request to the inventory API.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// TTL for the cached `(method, parameterized-path) -> endpointId` listing.
pub const LIST_ENDPOINTS_TTL: Duration = Duration::from_secs(300);

/// Origin tag sent when uploading a fresh application's OpenAPI spec. The
/// platform this grew up on is Kubernetes-daemonset deployment; other
/// deployment shapes would pick a different tag here.
pub const ORIGIN_TAG: &str = "K8S_DAEMONSET";

/// Bounded retries when an instance-creation response carries no usable id,
/// on the theory that instance creation may finish asynchronously server-side.
const INSTANCE_POLL_ATTEMPTS: u32 = 3;
const INSTANCE_POLL_DELAY: Duration = Duration::from_millis(500);

struct EndpointCacheEntry {
    fetched_at: Instant,
    endpoints: HashMap<EndpointKey, String>,
}

/// Client for the inventory control-plane API: bolt preview/commit, the
/// add-endpoint fallback, and application/instance creation. One instance is
/// shared across all captures; the endpoint-listing cache is the only
/// internal mutable state and is guarded by its own mutex.
pub struct SyncClient {
    http: Client,
    base_url: String,
    // A `Mutex<String>` rather than a plain field: the registry hot-reloads
    // its mount document, and an operator rotating the API key after a 401
    // must take effect on the next call without restarting the process.
    api_key: Mutex<String>,
    endpoint_cache: Mutex<HashMap<(String, String), EndpointCacheEntry>>,
}

impl SyncClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: Mutex::new(api_key.into().trim().to_string()),
            endpoint_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the bearer token used for subsequent calls. Callers refresh
    /// this from the registry's latest snapshot before each onboarding/push
    /// attempt so a mount-document key rotation takes effect immediately.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        let mut guard = self.api_key.lock().expect("api key mutex poisoned");
        *guard = api_key.into().trim().to_string();
    }

    fn auth_header(&self) -> String {
        let key = self.api_key.lock().expect("api key mutex poisoned");
        format!("Bearer {key}")
    }

    async fn classify_error(resp: reqwest::Response) -> SyncError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            error!(%status, body, "unauthorized response from inventory API");
            return SyncError::Unauthorized;
        }
        error!(%status, body, "inventory API call failed");
        SyncError::Transient(format!("HTTP {status}"))
    }

    /// `GET /v1/applications?include=metadata`, searching for an exact
    /// case-sensitive name match.
    pub async fn get_application_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Application>, SyncError> {
        let url = format!("{}/v1/applications?include=metadata", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let parsed: ApplicationsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        Ok(parsed.applications.into_iter().find(|a| a.application_name == name))
    }

    /// Upload-spec-then-instance dance: find an existing application by
    /// name and reuse its first instance, or create one from scratch.
    pub async fn create_application(&self, service_name: &str) -> Result<ApplicationHandle, SyncError> {
        if let Some(existing) = self.get_application_by_name(service_name).await? {
            if let Some(instance) = existing.instances.first() {
                info!(service = service_name, app_id = %existing.application_id, "reusing existing application and instance");
                return Ok(ApplicationHandle {
                    application_id: existing.application_id,
                    instance_id: instance.instance_id.clone(),
                });
            }
            warn!(service = service_name, "existing application has no instances; creating one");
            let instance_id = self.create_instance(&existing.application_id, service_name).await?;
            return Ok(ApplicationHandle {
                application_id: existing.application_id,
                instance_id,
            });
        }

        let spec = minimal_openapi_spec(service_name);
        let spec_bytes = serde_json::to_vec_pretty(&spec).map_err(|e| SyncError::Malformed(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "fileUpload",
                reqwest::multipart::Part::bytes(spec_bytes)
                    .file_name("openapi-spec.json")
                    .mime_str("application/json")
                    .map_err(|e| SyncError::Malformed(e.to_string()))?,
            )
            .text("applicationName", service_name.to_string())
            .text("origin", ORIGIN_TAG);

        let url = format!("{}/v1/applications/oas", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let uploaded: OasUploadResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        let instance_id = self.create_instance(&uploaded.application_id, service_name).await?;

        Ok(ApplicationHandle {
            application_id: uploaded.application_id,
            instance_id,
        })
    }

    /// `POST /v1/applications/{appId}/instances/batch`.
    pub async fn create_instance(&self, app_id: &str, service_name: &str) -> Result<String, SyncError> {
        let url = format!("{}/v1/applications/{app_id}/instances/batch", self.base_url);
        let payload = serde_json::json!({
            "instanceRequestItems": [{
                "hostUrl": "/",
                "instanceName": format!("{service_name}_instance"),
            }]
        });

        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let parsed: InstanceBatchResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        let instance_id = match parsed {
            InstanceBatchResponse::List(items) | InstanceBatchResponse::Wrapped { items } => {
                items.into_iter().find_map(|i| i.instance_id)
            }
            InstanceBatchResponse::Single(item) => item.instance_id,
        };

        match instance_id {
            Some(id) => Ok(id),
            None => self.poll_for_instance_id(app_id).await,
        }
    }

    /// The `instances/batch` response carried no id in any of its known
    /// shapes. Re-fetch the application a bounded number of times with a
    /// short backoff in case instance creation completes asynchronously.
    async fn poll_for_instance_id(&self, app_id: &str) -> Result<String, SyncError> {
        warn!(app_id, "instance batch response carried no instanceId; polling application list");
        for attempt in 1..=INSTANCE_POLL_ATTEMPTS {
            tokio::time::sleep(INSTANCE_POLL_DELAY).await;
            let url = format!("{}/v1/applications?include=metadata", self.base_url);
            let resp = self
                .http
                .get(&url)
                .header("Authorization", self.auth_header())
                .send()
                .await
                .map_err(|e| SyncError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::classify_error(resp).await);
            }
            let parsed: ApplicationsResponse = resp
                .json()
                .await
                .map_err(|e| SyncError::Malformed(e.to_string()))?;
            if let Some(app) = parsed.applications.into_iter().find(|a| a.application_id == app_id) {
                if let Some(instance) = app.instances.first() {
                    info!(app_id, attempt, "instance id appeared after polling");
                    return Ok(instance.instance_id.clone());
                }
            }
        }
        Err(SyncError::Malformed(format!(
            "no instance appeared for application {app_id} after {INSTANCE_POLL_ATTEMPTS} polls"
        )))
    }

    /// `GET .../endpoints?include=metadata&slim=true`, cached for
    /// [`LIST_ENDPOINTS_TTL`] and keyed by `(method, parameterized-path)`.
    pub async fn list_endpoints(
        &self,
        app_id: &str,
        instance_id: &str,
    ) -> Result<HashMap<EndpointKey, String>, SyncError> {
        let cache_key = (app_id.to_string(), instance_id.to_string());
        {
            let cache = self.endpoint_cache.lock().expect("endpoint cache mutex poisoned");
            if let Some(entry) = cache.get(&cache_key) {
                if entry.fetched_at.elapsed() < LIST_ENDPOINTS_TTL {
                    return Ok(entry.endpoints.clone());
                }
            }
        }

        let url = format!(
            "{}/v1/applications/{app_id}/instances/{instance_id}/endpoints?include=metadata&slim=true",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let parsed: EndpointsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        let mut endpoints = HashMap::new();
        for group in parsed.endpoint_groups {
            for ep in group.endpoints {
                let key = EndpointKey {
                    method: ep.method.to_uppercase(),
                    parameterized_path: parameterize(&ep.path),
                };
                endpoints.insert(key, ep.id);
            }
        }

        let mut cache = self.endpoint_cache.lock().expect("endpoint cache mutex poisoned");
        cache.insert(
            cache_key,
            EndpointCacheEntry {
                fetched_at: Instant::now(),
                endpoints: endpoints.clone(),
            },
        );

        Ok(endpoints)
    }

    /// `POST .../bolt/preview`: encode the capture as a single-request bolt
    /// envelope and upload it as a multipart file.
    pub async fn bolt_preview(
        &self,
        app_id: &str,
        instance_id: &str,
        capture: &Capture,
    ) -> Result<BoltPreviewResponse, SyncError> {
        let envelope = BoltEnvelope {
            requests: vec![BoltRequest {
                method: capture.method.to_string(),
                url: capture.endpoint.clone(),
                request_headers: capture.request_headers.clone(),
                request_body: capture.request_body.as_ref().map(|b| b.as_str().to_string()),
            }],
        };
        let bolt_json = serde_json::to_vec(&envelope).map_err(|e| SyncError::Malformed(e.to_string()))?;

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bolt_json)
                .file_name("bolt.json")
                .mime_str("application/json")
                .map_err(|e| SyncError::Malformed(e.to_string()))?,
        );

        let url = format!(
            "{}/v1/applications/{app_id}/instances/{instance_id}/bolt/preview",
            self.base_url
        );
        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let parsed: BoltPreviewResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        info!(
            matched = parsed.matched_requests,
            unmatched = parsed.unmatched_requests,
            "bolt preview complete"
        );

        Ok(parsed)
    }

    /// `POST .../bolt/commit` applying a single suggestion's match.
    pub async fn bolt_commit(
        &self,
        app_id: &str,
        instance_id: &str,
        suggestion: &EndpointSuggestion,
        capture: &Capture,
    ) -> Result<(), SyncError> {
        let request_body_example = capture.request_body.as_ref().map(|body| RequestBodyExample {
            content_type: capture
                .request_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "application/json".to_string()),
            content: body.as_str().trim().to_string(),
        });

        let payload = BoltCommitRequest {
            apply_request_bodies: true,
            endpoints: vec![BoltEndpointSelection {
                endpoint_id: suggestion.endpoint_id.clone(),
                include: true,
                path_params: suggestion.path_params.clone(),
                query_params: suggestion.query_params.clone(),
                headers: capture.request_headers.clone(),
                request_body_example,
            }],
        };

        let url = format!(
            "{}/v1/applications/{app_id}/instances/{instance_id}/bolt/commit",
            self.base_url
        );
        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        info!(endpoint_id = %suggestion.endpoint_id, "bolt commit successful");
        Ok(())
    }

    /// Legacy fallback for a genuinely new endpoint: parameterize the path
    /// client-side (so future concrete variants match the same template via
    /// bolt preview) and add it directly.
    pub async fn add_endpoint(
        &self,
        app_id: &str,
        instance_id: &str,
        capture: &Capture,
    ) -> Result<(), SyncError> {
        let entry = AddEndpointEntry {
            method: capture.method.to_string().to_lowercase(),
            endpoint: parameterize(&capture.endpoint),
            payload: capture
                .request_body
                .as_ref()
                .map(|b| b.as_str().to_string())
                .unwrap_or_default(),
        };

        let url = format!(
            "{}/v1/applications/{app_id}/instances/{instance_id}/add-endpoints",
            self.base_url
        );
        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&vec![entry])
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        info!(endpoint = %parameterize(&capture.endpoint), "added new endpoint via fallback path");
        Ok(())
    }

    /// `PUT .../endpoints/{endpointId}`: update query params and/or a
    /// request-body exemplar on an already-known endpoint. Not part of the
    /// primary bolt preview/commit/add-endpoint flow in §4.I, but exposed
    /// for operators correcting a previously-synced endpoint's exemplar.
    pub async fn update_endpoint(
        &self,
        app_id: &str,
        instance_id: &str,
        endpoint_id: &str,
        query_params: Option<HashMap<String, String>>,
        request_body: Option<(&str, &str)>,
    ) -> Result<(), SyncError> {
        let mut event_data = serde_json::Map::new();
        if let Some(qp) = query_params {
            event_data.insert("queryParams".to_string(), serde_json::json!(qp));
        }
        if let Some((content_type, content)) = request_body {
            event_data.insert(
                "requestBody".to_string(),
                serde_json::json!({ "contentType": content_type, "content": content }),
            );
        }
        let payload = serde_json::json!({
            "eventType": "UPDATE",
            "eventData": event_data,
        });

        let url = format!(
            "{}/v1/applications/{app_id}/instances/{instance_id}/endpoints/{endpoint_id}",
            self.base_url
        );
        let resp = self
            .http
            .put(&url)
            .header("Authorization", self.auth_header())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        info!(endpoint_id, "endpoint updated");
        Ok(())
    }

    /// Push one request-kind capture via the bolt preview/commit flow,
    /// falling back to add-endpoint when nothing matches. This is the
    /// top-level entry a writer calls for every sync'd capture.
    pub async fn push_endpoint(
        &self,
        app_id: &str,
        instance_id: &str,
        capture: &Capture,
    ) -> Result<(), SyncError> {
        let preview = self.bolt_preview(app_id, instance_id, capture).await?;

        match preview.endpoint_suggestions.first() {
            Some(suggestion) => self.bolt_commit(app_id, instance_id, suggestion, capture).await,
            None => self.add_endpoint(app_id, instance_id, capture).await,
        }
    }
}

fn minimal_openapi_spec(service_name: &str) -> serde_json::Value {
    serde_json::json!({
        "openapi": "3.0.0",
        "info": { "title": service_name, "version": "1.0.0" },
        "servers": [{ "url": "/" }],
        "paths": {},
    })
}
