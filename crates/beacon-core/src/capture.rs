use std::net::IpAddr;

use tokio::sync::mpsc;

use crate::error::CaptureError;

/// One TCP segment's payload, handed from the packet source to the flow table.
#[derive(Debug, Clone)]
pub struct PacketFrame {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Seam between the link-layer/raw-socket backend and the rest of the
/// pipeline. Kept abstract so tests can drive the flow table from synthetic
/// frames without opening real sockets; exactly one production implementation
/// exists.
pub trait PacketSource: Send {
    fn start(&mut self) -> Result<mpsc::Receiver<PacketFrame>, CaptureError>;
    fn stop(&mut self) -> Result<(), CaptureError>;
    fn name(&self) -> &str;
}
