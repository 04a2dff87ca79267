use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beacon_core::capture::{PacketFrame, PacketSource};
use beacon_core::error::CaptureError;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use pnet_datalink::Channel::Ethernet;
use pnet_datalink::NetworkInterface;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::interfaces::select_interfaces;

/// Plaintext-HTTP ports worth spending CPU decoding. Anything else on the
/// wire is dropped before it reaches the flow table.
pub const WATCHED_PORTS: &[u16] = &[80, 8080, 8000, 3000, 5000, 8443, 9000];

/// Link-layer capture backend: opens one datalink channel per selected
/// interface, each staggered slightly on startup, and forwards matching TCP
/// payloads to a single channel consumed by the flow table.
pub struct DatalinkPacketSource {
    interface_override: Option<Vec<String>>,
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DatalinkPacketSource {
    pub fn new(interface_override: Option<Vec<String>>) -> Self {
        Self {
            interface_override,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    fn chosen_interfaces(&self) -> Vec<NetworkInterface> {
        let all = pnet_datalink::interfaces();
        match &self.interface_override {
            Some(names) => {
                crate::interfaces::select_named(all, names.iter().map(String::as_str))
            }
            None => select_interfaces(all),
        }
    }
}

impl PacketSource for DatalinkPacketSource {
    fn start(&mut self) -> Result<mpsc::Receiver<PacketFrame>, CaptureError> {
        let ifaces = self.chosen_interfaces();
        if ifaces.is_empty() {
            return Err(CaptureError::StartFailed(
                "no usable network interfaces found".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(4096);
        self.running.store(true, Ordering::SeqCst);

        for (i, iface) in ifaces.into_iter().enumerate() {
            let tx = tx.clone();
            let running = Arc::clone(&self.running);
            let stagger = Duration::from_millis(500 * i as u64);

            let handle = thread::Builder::new()
                .name(format!("beacon-capture-{}", iface.name))
                .spawn(move || {
                    thread::sleep(stagger);
                    if let Err(e) = capture_loop(&iface, &tx, &running) {
                        warn!(interface = %iface.name, error = %e, "capture loop exited");
                    }
                })
                .map_err(|e| CaptureError::StartFailed(e.to_string()))?;

            self.handles.push(handle);
        }

        Ok(rx)
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "datalink"
    }
}

fn capture_loop(
    iface: &NetworkInterface,
    tx: &mpsc::Sender<PacketFrame>,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    let (_, mut rx) = match pnet_datalink::channel(iface, Default::default()) {
        Ok(Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(CaptureError::StartFailed(
                "unsupported channel type".into(),
            ))
        }
        Err(e) => {
            return Err(CaptureError::StartFailed(format!(
                "opening datalink channel for {}: {e}",
                iface.name
            )))
        }
    };

    while running.load(Ordering::SeqCst) {
        match rx.next() {
            Ok(bytes) => {
                if let Some(frame) = parse_frame(bytes) {
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                debug!(interface = %iface.name, error = %e, "read error");
            }
        }
    }
    Ok(())
}

fn parse_frame(bytes: &[u8]) -> Option<PacketFrame> {
    let eth = EthernetPacket::new(bytes)?;
    match eth.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(eth.payload()),
        EtherTypes::Ipv6 => parse_ipv6(eth.payload()),
        _ => None,
    }
}

fn parse_ipv4(bytes: &[u8]) -> Option<PacketFrame> {
    let ip = Ipv4Packet::new(bytes)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    build_frame(IpAddr::V4(ip.get_source()), IpAddr::V4(ip.get_destination()), ip.payload())
}

fn parse_ipv6(bytes: &[u8]) -> Option<PacketFrame> {
    let ip = Ipv6Packet::new(bytes)?;
    if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    build_frame(IpAddr::V6(ip.get_source()), IpAddr::V6(ip.get_destination()), ip.payload())
}

fn build_frame(src_ip: IpAddr, dst_ip: IpAddr, bytes: &[u8]) -> Option<PacketFrame> {
    let tcp = TcpPacket::new(bytes)?;
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
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        payload: payload.to_vec(),
    })
}
