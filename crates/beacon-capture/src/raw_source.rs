use std::mem::MaybeUninit;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use beacon_core::capture::{PacketFrame, PacketSource};
use beacon_core::error::CaptureError;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::source::WATCHED_PORTS;

/// Fallback backend for environments where a link-layer channel can't be
/// opened (no `CAP_NET_RAW` + `CAP_NET_ADMIN`, or the interface simply
/// doesn't support a datalink channel type). Opens one `SOCK_RAW`/
/// `IPPROTO_TCP` socket, which needs only `CAP_NET_RAW`, and reads whatever
/// IPv4 TCP segments the kernel hands back system-wide. IPv6 is not
/// reachable through this path; that's an accepted loss of coverage in
/// exchange for degrading gracefully (see module docs on §1's "lossy
/// observation is acceptable" non-goal) instead of refusing to start.
pub struct RawSocketPacketSource {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RawSocketPacketSource {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Default for RawSocketPacketSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSource for RawSocketPacketSource {
    fn start(&mut self) -> Result<mpsc::Receiver<PacketFrame>, CaptureError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .map_err(|e| CaptureError::StartFailed(format!("opening raw IP socket: {e}")))?;

        let (tx, rx) = mpsc::channel(4096);
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name("beacon-capture-raw".to_string())
            .spawn(move || raw_capture_loop(socket, &tx, &running))
            .map_err(|e| CaptureError::StartFailed(e.to_string()))?;

        self.handle = Some(handle);
        Ok(rx)
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "raw-ip"
    }
}

fn raw_capture_loop(socket: Socket, tx: &mpsc::Sender<PacketFrame>, running: &AtomicBool) {
    let mut buf = [MaybeUninit::uninit(); 65536];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                // SAFETY: `recv` initialized the first `n` bytes of `buf`.
                let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
                if let Some(frame) = parse_ipv4_datagram(&bytes) {
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "raw socket read error");
            }
        }
    }
}

/// A `SOCK_RAW`/`IPPROTO_TCP` read hands back the IP datagram directly, with
/// no link-layer framing to strip first (unlike the datalink backend).
fn parse_ipv4_datagram(bytes: &[u8]) -> Option<PacketFrame> {
    let ip = Ipv4Packet::new(bytes)?;
    let tcp = TcpPacket::new(ip.payload())?;
    let src_port = tcp.get_source();
    let dst_port = tcp.get_destination();
    if !WATCHED_PORTS.contains(&src_port) && !WATCHED_PORTS.contains(&dst_port) {
        return None;
    }
    let payload = tcp.payload();
    if payload.is_empty() {
        return None;
    }
    Some(PacketFrame {
        src_ip: IpAddr::V4(ip.get_source()),
        src_port,
        dst_ip: IpAddr::V4(ip.get_destination()),
        dst_port,
        payload: payload.to_vec(),
    })
}

/// Open the preferred datalink backend, degrading to the raw-IP backend if
/// the link-layer channel can't be opened at all. Fatal only when neither
/// mode is usable (§4.A).
pub fn start_with_fallback(
    interface_override: Option<Vec<String>>,
) -> Result<(Box<dyn PacketSource>, mpsc::Receiver<PacketFrame>), CaptureError> {
    let mut datalink = crate::source::DatalinkPacketSource::new(interface_override);
    match datalink.start() {
        Ok(rx) => Ok((Box::new(datalink), rx)),
        Err(e) => {
            warn!(error = %e, "link-layer capture unavailable, falling back to raw IP sockets");
            let mut raw = RawSocketPacketSource::new();
            let rx = raw.start().map_err(|raw_err| {
                CaptureError::StartFailed(format!(
                    "no usable capture backend: datalink failed ({e}), raw socket failed ({raw_err})"
                ))
            })?;
            Ok((Box::new(raw), rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_port_segment_is_kept() {
        // Build a minimal IPv4 header (20 bytes) + TCP header (20 bytes) by
        // hand so the parser is exercised without a live socket.
        let mut buf = vec![0u8; 40 + 3];
        buf[0] = 0x45; // version 4, IHL 5
        buf[9] = 6; // protocol = TCP
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
        // TCP header starts at byte 20: src port 80, dst port 5555
        buf[20..22].copy_from_slice(&80u16.to_be_bytes());
        buf[22..24].copy_from_slice(&5555u16.to_be_bytes());
        buf[32] = 0x50; // data offset 5 (no TCP options)
        buf[40..43].copy_from_slice(b"hi!");

        let frame = parse_ipv4_datagram(&buf).expect("frame should parse");
        assert_eq!(frame.src_port, 80);
        assert_eq!(frame.dst_port, 5555);
        assert_eq!(frame.payload, b"hi!");
    }

    #[test]
    fn unwatched_port_segment_is_dropped() {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x45;
        buf[9] = 6;
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
        buf[20..22].copy_from_slice(&4444u16.to_be_bytes());
        buf[22..24].copy_from_slice(&4445u16.to_be_bytes());
        buf[32] = 0x50;

        assert!(parse_ipv4_datagram(&buf).is_none());
    }
}
