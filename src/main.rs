mod config;
mod writer;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use beacon_capture::{start_with_fallback, FlowTable, ServiceTag, FLOW_IDLE_TIMEOUT};
use beacon_core::capture::PacketSource;
use beacon_dedup::DedupCache;
use beacon_onboard::OnboardCoordinator;
use beacon_registry::ServiceRegistry;
use beacon_resolve::{resolve_service, ClusterResolver, KubectlResolver};
use beacon_sync::SyncClient;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, RuntimeConfig};
use writer::{JsonlSink, Writer};

/// Bridges `beacon-resolve`'s free function into the `ServiceTag` callback
/// the flow table invokes while stamping a parsed request's direction context.
struct HostResolver<C: ClusterResolver> {
    cluster: C,
}

impl<C: ClusterResolver> ServiceTag for HostResolver<C> {
    fn tag(&self, host: Option<&str>, dst_ip: IpAddr) -> String {
        resolve_service(host, dst_ip, &self.cluster)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = RuntimeConfig::resolve(Cli::parse());

    eprintln!(
        "beacon: node={} output={} config={}",
        cfg.node_name,
        cfg.output_file.display(),
        cfg.config_path.display()
    );

    let registry = Arc::new(ServiceRegistry::new(
        cfg.config_path.clone(),
        beacon_registry::DEFAULT_OVERLAY_PATH,
    ));
    if cfg.clear_saved_mappings {
        if let Err(e) = registry.clear_mappings() {
            tracing::warn!(error = %e, "CRITICAL: failed to clear saved mappings at startup");
        }
    }

    let snapshot = registry.reload()?;
    let sync = Arc::new(SyncClient::new(
        snapshot.apisec_url.clone(),
        snapshot.api_key.clone().unwrap_or_default(),
    ));
    let onboard = Arc::new(OnboardCoordinator::new(registry.clone(), sync.clone()));
    let dedup = Arc::new(DedupCache::default());
    let sink = Arc::new(JsonlSink::open(&cfg.output_file)?);
    let writer = Arc::new(Writer::new(
        sink,
        dedup,
        onboard,
        sync,
        registry,
        cfg.enable_sync,
    ));

    let flow_table = Arc::new(FlowTable::new(cfg.node_name.clone()));
    let resolver = Arc::new(HostResolver { cluster: KubectlResolver });

    let (mut source, mut frames) = match start_with_fallback(cfg.interfaces.clone()) {
        Ok(started) => started,
        Err(e) => {
            eprintln!("beacon: CRITICAL: failed to start packet capture: {e}");
            return Err(e.into());
        }
    };

    eprintln!("beacon: capture started via {} backend", source.name());

    {
        let flow_table = Arc::clone(&flow_table);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                flow_table.evict_idle(FLOW_IDLE_TIMEOUT);
            }
        });
    }

    let ingest_loop = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let flow_table = Arc::clone(&flow_table);
            let resolver = Arc::clone(&resolver);
            let writer = Arc::clone(&writer);
            tokio::task::spawn_blocking(move || {
                let captures = flow_table.ingest(frame, resolver.as_ref());
                for capture in captures {
                    writer.handle(capture);
                }
            });
        }
    });

    tokio::signal::ctrl_c().await.ok();
    eprintln!("beacon: shutting down");
    ingest_loop.abort();
    source.stop()?;

    Ok(())
}
