//! Live capture source for httptap
//!
//! This module opens a libpcap handle on a network interface and pulls
//! frames in a blocking loop on the capture thread.

use crate::capture::{bpf_filter, CaptureError, CaptureStats, PacketSource};
use crate::config::CaptureSettings;
use pcap::{Active, Capture, Device, Linktype};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

const SNAPLEN: i32 = 65_535;
/// Read timeout; bounds how long the loop runs before rechecking `stop`.
const READ_TIMEOUT_MS: i32 = 1_000;

/// Live packet source backed by a pcap handle.
pub struct LiveCapture {
    capture: Capture<Active>,
}

impl LiveCapture {
    /// Resolve the interface, open the handle, and install the BPF filter.
    ///
    /// All failures here are synchronous start failures: the capture thread
    /// is never spawned on error.
    pub fn open(settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let device = resolve_device(&settings.interface)?;
        let device_name = device.name.clone();

        let mut capture: Capture<Active> = Capture::from_device(device)
            .map_err(|e| CaptureError::OpenFailed(e.to_string()))?
            .snaplen(SNAPLEN)
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::OpenFailed(e.to_string()))?;

        capture
            .set_datalink(Linktype::ETHERNET)
            .map_err(|e| CaptureError::OpenFailed(format!("set_datalink(EN10MB): {}", e)))?;

        let filter = bpf_filter(&settings.ports);
        capture
            .filter(&filter, true)
            .map_err(|e| CaptureError::OpenFailed(format!("filter {:?}: {}", filter, e)))?;

        info!(
            interface = %device_name,
            ports = ?settings.ports,
            "capture started"
        );

        Ok(Self { capture })
    }
}

fn resolve_device(interface: &str) -> Result<Device, CaptureError> {
    if interface.is_empty() {
        return Device::lookup()
            .map_err(|e| CaptureError::InvalidInterface(e.to_string()))?
            .ok_or_else(|| {
                CaptureError::InvalidInterface("no default capture device".to_string())
            });
    }
    Device::list()
        .map_err(|e| CaptureError::InvalidInterface(e.to_string()))?
        .into_iter()
        .find(|d| d.name == interface)
        .ok_or_else(|| CaptureError::InvalidInterface(interface.to_string()))
}

impl PacketSource for LiveCapture {
    fn run(
        &mut self,
        stop: &AtomicBool,
        handler: &mut dyn FnMut(&[u8]),
    ) -> Result<(), CaptureError> {
        while !stop.load(Ordering::SeqCst) {
            match self.capture.next_packet() {
                Ok(packet) => handler(packet.data),
                // Timeout wakes the loop so the stop flag gets rechecked.
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => return Err(CaptureError::Unrecoverable(e.to_string())),
            }
        }
        Ok(())
    }

    fn stats(&mut self) -> Option<CaptureStats> {
        match self.capture.stats() {
            Ok(stat) => Some(CaptureStats {
                packets_received: stat.received as u64,
                packets_dropped: stat.dropped as u64,
                packets_if_dropped: stat.if_dropped as u64,
            }),
            Err(_) => None,
        }
    }
}
