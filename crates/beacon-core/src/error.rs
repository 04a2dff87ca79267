use thiserror::Error;

/// Failures starting or stopping the packet source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture: {0}")]
    StartFailed(String),
    #[error("failed to stop capture: {0}")]
    StopFailed(String),
    #[error("{0}")]
    Other(String),
}

/// Hard decode failures, distinct from the ordinary `Incomplete`/`NotHttp`
/// branches of `ParseOutcome` which are not errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),
}

/// Failures reading or writing the service registry's config documents.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config json at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures from the onboarding coordinator's state machine.
#[derive(Debug, Error)]
pub enum OnboardError {
    #[error("another onboarding attempt for {service} is already in flight")]
    InFlight { service: String },
    #[error("registry error during onboarding: {0}")]
    Registry(#[from] RegistryError),
    #[error("sync error during onboarding: {0}")]
    Sync(#[from] SyncError),
}

/// Failures talking to the inventory API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unauthorized: API key rejected")]
    Unauthorized,
    #[error("transient sync failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}
