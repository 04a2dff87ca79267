use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};

use beacon_core::sink::TraceSink;
use beacon_core::trace::Capture;
use beacon_dedup::DedupCache;
use beacon_onboard::{OnboardCoordinator, OnboardOutcome};
use beacon_registry::ServiceRegistry;
use beacon_resolve::UNKNOWN_SERVICE;
use beacon_sync::SyncClient;
use tracing::warn;

/// Marker prefix on every stdout line carrying a capture, matching the
/// original daemon's log convention so `kubectl logs | grep` keeps working.
pub const CAPTURE_LOG_PREFIX: &str = "ENDPOINT_CAPTURE:";

/// Appends one JSON object per line to a local append-only file, and prints
/// the same line to stdout behind [`CAPTURE_LOG_PREFIX`].
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TraceSink for JsonlSink {
    fn record(&self, capture: &Capture) -> std::io::Result<()> {
        let line = serde_json::to_string(capture).expect("capture always serializes");
        println!("{CAPTURE_LOG_PREFIX}{line}");
        let mut file = self.file.lock().expect("jsonl sink mutex poisoned");
        writeln!(file, "{line}")
    }
}

/// The writer component (§4.J): write-local unconditionally, then a de-dup
/// check, then either skip or dispatch to sync on a background task. Sync
/// is attempted only for request-kind captures with a resolved service.
pub struct Writer {
    sink: Arc<dyn TraceSink>,
    dedup: Arc<DedupCache>,
    onboard: Arc<OnboardCoordinator>,
    sync: Arc<SyncClient>,
    registry: Arc<ServiceRegistry>,
    enable_sync: bool,
}

impl Writer {
    pub fn new(
        sink: Arc<dyn TraceSink>,
        dedup: Arc<DedupCache>,
        onboard: Arc<OnboardCoordinator>,
        sync: Arc<SyncClient>,
        registry: Arc<ServiceRegistry>,
        enable_sync: bool,
    ) -> Self {
        Self {
            sink,
            dedup,
            onboard,
            sync,
            registry,
            enable_sync,
        }
    }

    /// Handle one capture. Local persistence happens inline; sync dispatch
    /// (if eligible) happens on a spawned task so no capture blocks another.
    pub fn handle(self: &Arc<Self>, capture: Capture) {
        if let Err(e) = self.sink.record(&capture) {
            warn!(error = %e, "failed to write capture to local log");
        }

        if !self.enable_sync || !capture.is_request() || capture.service == UNKNOWN_SERVICE {
            return;
        }
        if self.dedup.is_duplicate(&capture) {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.push(capture).await;
        });
    }

    async fn push(&self, capture: Capture) {
        // Refresh the bearer token from the registry's latest snapshot
        // before every attempt, so an operator's key rotation in the mount
        // document takes effect without a restart.
        if let Ok(snapshot) = self.registry.reload() {
            if let Some(api_key) = snapshot.api_key.as_deref() {
                self.sync.set_api_key(api_key);
            }
        }

        match self.onboard.ensure_mapped(&capture.service).await {
            OnboardOutcome::Mapped(mapping) => {
                if let Err(e) = self
                    .sync
                    .push_endpoint(&mapping.app_id, &mapping.instance_id, &capture)
                    .await
                {
                    warn!(service = %capture.service, error = %e, "sync push failed");
                }
            }
            OnboardOutcome::InFlight | OnboardOutcome::Disabled | OnboardOutcome::Failed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::trace::{CaptureKind, HttpMethod};
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capture(service: &str, kind: CaptureKind) -> Capture {
        Capture {
            id: "c1".to_string(),
            kind,
            timestamp: SystemTime::now(),
            node: "node-a".to_string(),
            service: service.to_string(),
            method: HttpMethod::Get,
            endpoint: "/x".to_string(),
            url: format!("http://{service}/x"),
            host: Some(service.to_string()),
            src_addr: "10.0.0.1:1".to_string(),
            dst_addr: "10.0.0.2:80".to_string(),
            request_headers: HashMap::new(),
            request_body: None,
            status_code: None,
            status_text: None,
            response_headers: HashMap::new(),
            response_body: None,
            http_version: "HTTP/1.1".to_string(),
        }
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        sink.record(&capture("orders", CaptureKind::Request)).unwrap();
        sink.record(&capture("billing", CaptureKind::Request)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("orders"));
        assert!(contents.contains("billing"));
    }

    #[tokio::test]
    async fn unknown_service_is_logged_but_never_sync_dispatched() {
        let dir = tempdir().unwrap();
        let mount = dir.path().join("mount.json");
        std::fs::write(&mount, r#"{"apiKey":"K","autoOnboardNewServices":true}"#).unwrap();
        let registry = Arc::new(ServiceRegistry::new(mount, dir.path().join("overlay.json")));

        // No mock server: any sync attempt would error out immediately.
        let sync = Arc::new(SyncClient::new("http://127.0.0.1:1", "K"));
        let onboard = Arc::new(OnboardCoordinator::new(registry.clone(), sync.clone()));
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(60)));
        let sink = Arc::new(JsonlSink::open(&dir.path().join("out.jsonl")).unwrap());
        let writer = Arc::new(Writer::new(sink, dedup, onboard, sync, registry, true));

        writer.handle(capture(UNKNOWN_SERVICE, CaptureKind::Request));
        // No panic, no hang: the unknown-service short-circuit returns
        // before anything reaches the onboarding/sync path.
    }

    #[tokio::test]
    async fn known_service_dispatches_to_sync_in_background() {
        let dir = tempdir().unwrap();
        let overlay = dir.path().join("overlay.json");
        std::fs::write(
            &overlay,
            r#"{"serviceMappings":{"orders":{"appId":"A1","instanceId":"I1"}}}"#,
        )
        .unwrap();
        let mount = dir.path().join("mount.json");
        std::fs::write(&mount, r#"{"apiKey":"K","autoOnboardNewServices":true}"#).unwrap();
        let registry = Arc::new(ServiceRegistry::new(mount, overlay));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/applications/A1/instances/I1/bolt/preview"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "endpointSuggestions": [],
                "unmatched": [],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/applications/A1/instances/I1/add-endpoints"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let sync = Arc::new(SyncClient::new(server.uri(), "K"));
        let onboard = Arc::new(OnboardCoordinator::new(registry.clone(), sync.clone()));
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(60)));
        let sink = Arc::new(JsonlSink::open(&dir.path().join("out.jsonl")).unwrap());
        let writer = Arc::new(Writer::new(sink, dedup, onboard, sync, registry, true));

        writer.handle(capture("orders", CaptureKind::Request));
        // Give the spawned push task a moment to hit the mock server.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().any(|r| r.url.path().ends_with("/bolt/preview")));
    }

    #[tokio::test]
    async fn response_captures_are_never_sync_dispatched() {
        let dir = tempdir().unwrap();
        let mount = dir.path().join("mount.json");
        std::fs::write(&mount, r#"{"apiKey":"K","autoOnboardNewServices":true}"#).unwrap();
        let registry = Arc::new(ServiceRegistry::new(mount, dir.path().join("overlay.json")));

        let sync = Arc::new(SyncClient::new("http://127.0.0.1:1", "K"));
        let onboard = Arc::new(OnboardCoordinator::new(registry.clone(), sync.clone()));
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(60)));
        let sink = Arc::new(JsonlSink::open(&dir.path().join("out.jsonl")).unwrap());
        let writer = Arc::new(Writer::new(sink, dedup, onboard, sync, registry, true));

        writer.handle(capture("orders", CaptureKind::Response));
    }
}
