use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One entry of `GET /v1/applications?include=metadata`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub application_id: String,
    pub application_name: String,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApplicationsResponse {
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    #[allow(dead_code)]
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OasUploadResponse {
    pub application_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum InstanceBatchResponse {
    List(Vec<InstanceBatchItem>),
    Wrapped { items: Vec<InstanceBatchItem> },
    Single(InstanceBatchItem),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstanceBatchItem {
    pub instance_id: Option<String>,
}

/// Result of creating (or reusing) an application + instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationHandle {
    pub application_id: String,
    pub instance_id: String,
}

/// Resolved endpoint key, parameterized before it's used to index a cache so
/// concrete variants of the same template (`/users/1`, `/users/2`) collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub method: String,
    pub parameterized_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EndpointsResponse {
    #[serde(default)]
    pub endpoint_groups: Vec<EndpointGroup>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EndpointGroup {
    #[serde(default)]
    pub endpoints: Vec<EndpointMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EndpointMetadata {
    pub id: String,
    pub method: String,
    pub path: String,
}

/// One HTTP exchange as bolt's preview envelope wants it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BoltRequest {
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BoltEnvelope {
    pub requests: Vec<BoltRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSuggestion {
    pub endpoint_id: String,
    #[serde(default)]
    pub path_params: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoltPreviewResponse {
    #[serde(default)]
    pub endpoint_suggestions: Vec<EndpointSuggestion>,
    #[serde(default)]
    #[allow(dead_code)]
    pub unmatched: Vec<serde_json::Value>,
    #[serde(default)]
    pub matched_requests: u32,
    #[serde(default)]
    pub unmatched_requests: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestBodyExample {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BoltEndpointSelection {
    pub endpoint_id: String,
    pub include: bool,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_example: Option<RequestBodyExample>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BoltCommitRequest {
    pub apply_request_bodies: bool,
    pub endpoints: Vec<BoltEndpointSelection>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AddEndpointEntry {
    pub method: String,
    pub endpoint: String,
    pub payload: String,
}
