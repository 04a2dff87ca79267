mod client;
mod types;

pub use client::{SyncClient, DEFAULT_TIMEOUT, LIST_ENDPOINTS_TTL, ORIGIN_TAG};
pub use types::{
    Application, ApplicationHandle, BoltPreviewResponse, EndpointKey, EndpointSuggestion, Instance,
};
