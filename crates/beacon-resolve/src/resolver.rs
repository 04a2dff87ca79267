use std::net::IpAddr;
use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

/// Service name used when neither the `Host` header nor the cluster resolver
/// yields anything. Captures tagged `unknown` are logged but never sync'd.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Upper bound on time spent asking the orchestrator to map an IP to a
/// service name before giving up and returning `unknown`.
pub const CLUSTER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Out-of-band query from destination IP to a logical service name. The
/// production implementation shells out to `kubectl`; tests substitute a
/// fake so the resolver's merge logic can be exercised without a cluster.
pub trait ClusterResolver: Send + Sync {
    fn resolve(&self, dst_ip: IpAddr) -> Option<String>;
}

/// Resolves a destination IP to a service name the same soft way the
/// original daemon did: shell out to `kubectl`, jsonpath-filter for a pod
/// whose status IP matches, and read its app label; fall back to a Service
/// lookup by cluster IP. Absent or slow `kubectl` degrades to `None`, never
/// a hard error.
pub struct KubectlResolver;

impl ClusterResolver for KubectlResolver {
    fn resolve(&self, dst_ip: IpAddr) -> Option<String> {
        run_with_timeout(CLUSTER_LOOKUP_TIMEOUT, move || resolve_via_kubectl(dst_ip))
    }
}

fn resolve_via_kubectl(dst_ip: IpAddr) -> Option<String> {
    let ip = dst_ip.to_string();

    let pod_jsonpath = format!(
        "-o=jsonpath={{.items[?(@.status.podIP==\"{ip}\")].metadata.labels.app}}"
    );
    if let Some(app) = run_kubectl(&["get", "pods", "--all-namespaces", &pod_jsonpath]) {
        let app = app.trim();
        if !app.is_empty() {
            return Some(app.to_string());
        }
    }

    let svc_jsonpath =
        format!("-o=jsonpath={{.items[?(@.spec.clusterIP==\"{ip}\")].metadata.name}}");
    if let Some(name) = run_kubectl(&["get", "services", "--all-namespaces", &svc_jsonpath]) {
        let name = name.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    None
}

fn run_kubectl(args: &[&str]) -> Option<String> {
    let output = Command::new("kubectl").args(args).output().ok()?;
    if !output.status.success() {
        debug!(status = ?output.status, "kubectl lookup failed");
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Run `f` on a detached thread and wait up to `timeout`; if it doesn't
/// finish in time (or the process never had `kubectl` to begin with), the
/// caller sees `None` rather than blocking the capture path.
fn run_with_timeout<F>(timeout: Duration, f: F) -> Option<String>
where
    F: FnOnce() -> Option<String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            warn!(?timeout, "cluster resolver timed out");
            None
        }
    }
}

/// Hostname portion of a `Host` header, with any `:port` suffix stripped.
fn hostname_only(host: &str) -> &str {
    match host.rfind(':') {
        // `host:port` but not an IPv6 literal like `[::1]` or a bare IPv6 addr.
        Some(idx) if !host.contains('[') && host[..idx].parse::<IpAddr>().is_err() => {
            &host[..idx]
        }
        _ => host,
    }
}

fn is_ip_literal(hostname: &str) -> bool {
    let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
    trimmed.parse::<IpAddr>().is_ok()
}

/// Resolve a capture's service name per §4.D: prefer the first dotted label
/// of a non-IP `Host` header, else consult the cluster resolver by
/// destination IP, else `unknown`.
pub fn resolve_service(
    host: Option<&str>,
    dst_ip: IpAddr,
    cluster: &dyn ClusterResolver,
) -> String {
    if let Some(host) = host {
        let hostname = hostname_only(host);
        if !is_ip_literal(hostname) {
            if let Some(label) = hostname.split('.').next() {
                if !label.is_empty() {
                    return label.to_string();
                }
            }
        }
    }

    cluster
        .resolve(dst_ip)
        .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FakeCluster(Option<&'static str>);
    impl ClusterResolver for FakeCluster {
        fn resolve(&self, _dst_ip: IpAddr) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn dst() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn host_header_first_label_wins() {
        let svc = resolve_service(Some("user-service.ns.svc"), dst(), &FakeCluster(None));
        assert_eq!(svc, "user-service");
    }

    #[test]
    fn host_header_with_port_strips_port() {
        let svc = resolve_service(Some("orders.svc:8080"), dst(), &FakeCluster(None));
        assert_eq!(svc, "orders");
    }

    #[test]
    fn ip_literal_host_falls_back_to_cluster_resolver() {
        let svc = resolve_service(Some("10.0.0.5"), dst(), &FakeCluster(Some("billing")));
        assert_eq!(svc, "billing");
    }

    #[test]
    fn missing_host_falls_back_to_cluster_resolver() {
        let svc = resolve_service(None, dst(), &FakeCluster(Some("billing")));
        assert_eq!(svc, "billing");
    }

    #[test]
    fn all_failures_yield_unknown() {
        let svc = resolve_service(None, dst(), &FakeCluster(None));
        assert_eq!(svc, UNKNOWN_SERVICE);
    }
}
