use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use beacon_core::error::OnboardError;
use beacon_registry::{ServiceMapping, ServiceRegistry};
use beacon_sync::SyncClient;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Outcome of one onboarding attempt for a single capture. Names the states
/// the per-service state machine moves through: a capture either finds a
/// mapping already in place, finds another worker mid-onboarding, finds
/// auto-onboard turned off, or runs the onboarding sequence itself and
/// either lands in `Mapped` or falls back to `Unmapped` on failure.
#[derive(Debug)]
pub enum OnboardOutcome {
    /// A mapping exists for this service; the capture should be forwarded.
    Mapped(ServiceMapping),
    /// Another task is already onboarding this service; drop this attempt.
    InFlight,
    /// `autoOnboardNewServices` is false; the capture is logged, never sync'd.
    Disabled,
    /// Onboarding ran and failed; the per-service lock was released so the
    /// next capture retries from scratch.
    Failed,
}

/// Single-flight coordinator for first-time service onboarding. Per-service
/// locks are `tokio::sync::Mutex` so `try_lock` is non-blocking and the
/// guard can be held across the onboarding sequence's HTTP round-trips;
/// creation of a new per-service entry is itself serialized by a short-lived
/// `std::sync::Mutex` that never needs to be held during I/O.
pub struct OnboardCoordinator {
    registry: Arc<ServiceRegistry>,
    sync: Arc<SyncClient>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OnboardCoordinator {
    pub fn new(registry: Arc<ServiceRegistry>, sync: Arc<SyncClient>) -> Self {
        Self {
            registry,
            sync,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, service: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("onboard lock map poisoned");
        locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Ensure `service` has a persisted mapping, onboarding it if necessary.
    /// Never blocks waiting for another in-flight onboarding of the same
    /// service; the caller sees `InFlight` immediately instead.
    pub async fn ensure_mapped(&self, service: &str) -> OnboardOutcome {
        let snapshot = match self.registry.reload() {
            Ok(s) => s,
            Err(e) => {
                warn!(service, error = %e, "registry reload failed during onboarding check");
                return OnboardOutcome::Failed;
            }
        };
        if let Some(existing) = snapshot.mapping(service) {
            return OnboardOutcome::Mapped(existing.clone());
        }
        if !snapshot.auto_onboard {
            return OnboardOutcome::Disabled;
        }

        let lock = self.lock_for(service);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(service, "onboarding already in flight; dropping this attempt");
                return OnboardOutcome::InFlight;
            }
        };

        // Recheck under the lock: another task may have just finished.
        let snapshot = match self.registry.reload() {
            Ok(s) => s,
            Err(e) => {
                warn!(service, error = %e, "registry reload failed under onboarding lock");
                return OnboardOutcome::Failed;
            }
        };
        if let Some(existing) = snapshot.mapping(service) {
            return OnboardOutcome::Mapped(existing.clone());
        }

        match self.onboard(service).await {
            Ok(mapping) => OnboardOutcome::Mapped(mapping),
            Err(e) => {
                warn!(service, error = %e, "onboarding attempt failed; will retry on next capture");
                OnboardOutcome::Failed
            }
        }
    }

    async fn onboard(&self, service: &str) -> Result<ServiceMapping, OnboardError> {
        let handle = self.sync.create_application(service).await?;
        let mapping = ServiceMapping {
            app_id: handle.application_id,
            instance_id: handle.instance_id,
        };
        self.registry.set_mapping(service, mapping.clone())?;

        // `set_mapping` never overwrites an existing entry, so if another
        // process onboarded this service first between our reload and our
        // write, re-reading now returns the mapping that actually won.
        let snapshot = self.registry.reload()?;
        Ok(snapshot.mapping(service).cloned().unwrap_or(mapping))
    }
}
