use std::time::{Duration, Instant};

use beacon_core::capture::PacketFrame;
use beacon_core::decode::ParseOutcome;
use beacon_core::flow::FlowKey;
use beacon_core::trace::{Capture, HttpMethod};
use dashmap::DashMap;

use crate::decoder::{try_parse_request, try_parse_response};

/// Flow state an in-flight connection needs attributed to its eventual
/// response: the last request's method/endpoint/host/service.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: HttpMethod,
    pub endpoint: String,
    pub host: Option<String>,
    pub service: String,
}

struct FlowEntry {
    buffer: Vec<u8>,
    last_seen: Instant,
    request_ctx: Option<RequestContext>,
}

impl FlowEntry {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            last_seen: Instant::now(),
            request_ctx: None,
        }
    }
}

/// Default idle window after which a flow's buffered bytes are discarded.
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Accumulates TCP payload bytes per flow direction and hands complete
/// messages to the caller. Disjoint keys may be mutated concurrently; each
/// key's entry is exclusively owned for the duration of one `ingest` call.
pub struct FlowTable {
    entries: DashMap<FlowKey, FlowEntry>,
    node_name: String,
}

/// Annotates a capture with the service-resolution callback the table needs
/// to stamp request context, since resolution lives in a different crate.
/// `Send + Sync` so a single resolver can be shared across capture worker
/// threads behind an `Arc`.
pub trait ServiceTag: Send + Sync {
    fn tag(&self, host: Option<&str>, dst_ip: std::net::IpAddr) -> String;
}

impl FlowTable {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            node_name: node_name.into(),
        }
    }

    /// Absorb one packet frame; returns zero or more fully decoded captures
    /// (normally zero or one, but pipelined bytes may yield more).
    pub fn ingest(&self, frame: PacketFrame, resolver: &dyn ServiceTag) -> Vec<Capture> {
        let key = FlowKey::new(frame.src_ip, frame.src_port, frame.dst_ip, frame.dst_port);
        let reverse = key.reversed();

        let mut entry = self.entries.entry(key).or_insert_with(FlowEntry::new);
        entry.buffer.extend_from_slice(&frame.payload);
        entry.last_seen = Instant::now();

        let mut out = Vec::new();
        loop {
            let src = (key.src_ip, key.src_port);
            let dst = (key.dst_ip, key.dst_port);
            let outcome = try_parse_request(&entry.buffer, src, dst, &self.node_name);
            match outcome {
                ParseOutcome::Complete { mut capture, consumed } => {
                    capture.service = resolver.tag(capture.host.as_deref(), dst.0);
                    entry.request_ctx = Some(RequestContext {
                        method: capture.method,
                        endpoint: capture.endpoint.clone(),
                        host: capture.host.clone(),
                        service: capture.service.clone(),
                    });
                    drain_front(&mut entry.buffer, consumed);
                    out.push(*capture);
                    continue;
                }
                ParseOutcome::Incomplete => break,
                ParseOutcome::NotHttp => {}
            }

            // Not a request (or not HTTP at all from this direction); try as a
            // response attributed to the reverse direction's last request.
            let req_ctx = self
                .entries
                .get(&reverse)
                .and_then(|e| e.request_ctx.clone());
            let outcome = try_parse_response(&entry.buffer, src, dst, &self.node_name, req_ctx.as_ref());
            match outcome {
                ParseOutcome::Complete { capture, consumed } => {
                    drain_front(&mut entry.buffer, consumed);
                    out.push(*capture);
                }
                ParseOutcome::Incomplete | ParseOutcome::NotHttp => break,
            }
        }

        out
    }

    /// Remove flow entries that have not received a packet within the idle
    /// window. Call periodically (or opportunistically) to bound memory.
    pub fn evict_idle(&self, timeout: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) < timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn drain_front(buf: &mut Vec<u8>, n: usize) {
    if n >= buf.len() {
        buf.clear();
    } else {
        buf.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedResolver;
    impl ServiceTag for FixedResolver {
        fn tag(&self, host: Option<&str>, _dst_ip: std::net::IpAddr) -> String {
            host.map(|h| h.split('.').next().unwrap_or(h).to_string())
                .unwrap_or_else(|| "unknown".to_string())
        }
    }

    fn frame(src_port: u16, dst_port: u16, payload: &[u8]) -> PacketFrame {
        PacketFrame {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn request_split_across_two_segments_produces_one_capture() {
        let table = FlowTable::new("node-a");
        let resolver = FixedResolver;

        let headers = frame(5555, 80, b"POST /x HTTP/1.1\r\nHost: orders.svc\r\nContent-Length: 7\r\n\r\n");
        let caps = table.ingest(headers, &resolver);
        assert!(caps.is_empty());

        let body = frame(5555, 80, b"{\"a\":1}");
        let caps = table.ingest(body, &resolver);
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].service, "orders");
        assert_eq!(caps[0].request_body.as_ref().unwrap().as_str(), "{\"a\":1}");
    }

    #[test]
    fn response_attributed_to_prior_request_on_reverse_flow() {
        let table = FlowTable::new("node-a");
        let resolver = FixedResolver;

        let req = frame(5555, 80, b"GET /y HTTP/1.1\r\nHost: billing.svc\r\n\r\n");
        table.ingest(req, &resolver);

        let resp = frame(80, 5555, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let caps = table.ingest(resp, &resolver);
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].endpoint, "/y");
        assert_eq!(caps[0].service, "billing");
    }

    #[test]
    fn idle_eviction_removes_stale_flows() {
        let table = FlowTable::new("node-a");
        let resolver = FixedResolver;
        table.ingest(frame(1, 2, b"GET / HTTP/1.1\r\n\r\n"), &resolver);
        assert_eq!(table.len(), 1);
        table.evict_idle(Duration::from_secs(0));
        assert_eq!(table.len(), 0);
    }
}
