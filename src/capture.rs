//! Live packet capture pump.
//!
//! Each `StartCapture` opens a libpcap handle on the named interface and
//! streams packets through a bounded channel; the blocking read loop runs
//! on its own thread so the gRPC stream never blocks the runtime. At most
//! one capture may be active per interface; the slot is reserved before
//! the device is touched and released when the stream ends, the caller
//! hangs up, or `StopCapture` fires.

use crate::error::{AgentError, Result};
use crate::proto::{CaptureRequest, CaptureStats, PacketData};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_SNAPLEN: i32 = 65535;
/// libpcap read timeout; bounds how long cancellation can lag.
const POLL_TIMEOUT_MS: i32 = 100;

struct CaptureHandle {
    node_id: String,
    cancel: CancellationToken,
    packets: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

/// Tracks the per-interface capture slots.
#[derive(Clone, Default)]
pub struct CaptureManager {
    active: Arc<DashMap<String, CaptureHandle>>,
}

impl CaptureManager {
    pub fn new() -> Self {
        CaptureManager::default()
    }

    /// Begin a capture, returning the packet stream.
    pub fn start(&self, request: &CaptureRequest) -> Result<mpsc::Receiver<PacketData>> {
        let interface = request.interface.clone();
        if interface.is_empty() {
            return Err(AgentError::validation("capture requires an interface"));
        }
        let snaplen = if request.snap_len > 0 {
            request.snap_len
        } else {
            DEFAULT_SNAPLEN
        };

        let cancel = CancellationToken::new();
        let packets = Arc::new(AtomicU64::new(0));
        let bytes = Arc::new(AtomicU64::new(0));
        self.reserve(
            &interface,
            CaptureHandle {
                node_id: request.node_id.clone(),
                cancel: cancel.clone(),
                packets: packets.clone(),
                bytes: bytes.clone(),
            },
        )?;

        // Only the reservation winner touches the device.
        let capture =
            match open_capture(&interface, snaplen, request.promiscuous, &request.filter) {
                Ok(capture) => capture,
                Err(e) => {
                    self.active.remove(&interface);
                    return Err(e);
                }
            };

        info!(
            "capture started on {interface} (snaplen {snaplen}, promiscuous {})",
            request.promiscuous
        );
        let (tx, rx) = mpsc::channel(256);
        let active = self.active.clone();
        tokio::task::spawn_blocking(move || {
            pump(capture, &interface, &cancel, &tx, &packets, &bytes);
            active.remove(&interface);
            info!("capture on {interface} ended");
        });
        Ok(rx)
    }

    /// Close every handle owned by `node_id` (empty means all) and return
    /// the cumulative counters.
    pub fn stop(&self, node_id: &str) -> CaptureStats {
        let mut stats = CaptureStats::default();
        let mut stopped = Vec::new();
        for entry in self.active.iter() {
            let handle = entry.value();
            if node_id.is_empty() || handle.node_id == node_id {
                handle.cancel.cancel();
                stats.packets_received += handle.packets.load(Relaxed);
                stats.bytes_received += handle.bytes.load(Relaxed);
                stopped.push(entry.key().clone());
            }
        }
        for interface in stopped {
            self.active.remove(&interface);
        }
        stats
    }

    /// Shutdown path: cancel everything.
    pub fn stop_all(&self) {
        self.stop("");
    }

    fn reserve(&self, interface: &str, handle: CaptureHandle) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.active.entry(interface.to_string()) {
            Entry::Occupied(_) => Err(AgentError::Resource(format!(
                "capture already running on {interface}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }
}

fn open_capture(
    interface: &str,
    snaplen: i32,
    promiscuous: bool,
    filter: &str,
) -> Result<pcap::Capture<pcap::Active>> {
    let mut capture = pcap::Capture::from_device(interface)
        .map_err(|e| AgentError::Resource(format!("open {interface}: {e}")))?
        .snaplen(snaplen)
        .promisc(promiscuous)
        .timeout(POLL_TIMEOUT_MS)
        .open()
        .map_err(|e| AgentError::Resource(format!("activate {interface}: {e}")))?;
    // Filter install happens before any packet is streamed; a bad filter
    // drops the freshly opened handle on the error path.
    if !filter.is_empty() {
        capture
            .filter(filter, true)
            .map_err(|e| AgentError::Resource(format!("bpf filter {filter:?}: {e}")))?;
    }
    Ok(capture)
}

fn pump(
    mut capture: pcap::Capture<pcap::Active>,
    interface: &str,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<PacketData>,
    packets: &AtomicU64,
    bytes: &AtomicU64,
) {
    let mut sequence: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match capture.next_packet() {
            Ok(packet) => {
                let ts_ns = packet.header.ts.tv_sec as i64 * 1_000_000_000
                    + packet.header.ts.tv_usec as i64 * 1_000;
                packets.fetch_add(1, Relaxed);
                bytes.fetch_add(u64::from(packet.header.caplen), Relaxed);
                let data = PacketData {
                    data: packet.data.to_vec(),
                    timestamp: ts_ns,
                    interface: interface.to_string(),
                    sequence,
                };
                sequence += 1;
                // A closed receiver means the caller's stream is gone.
                if tx.blocking_send(data).is_err() {
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!("capture read on {interface}: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(node_id: &str, packets: u64, bytes: u64) -> CaptureHandle {
        CaptureHandle {
            node_id: node_id.to_string(),
            cancel: CancellationToken::new(),
            packets: Arc::new(AtomicU64::new(packets)),
            bytes: Arc::new(AtomicU64::new(bytes)),
        }
    }

    #[test]
    fn test_one_capture_per_interface() {
        let manager = CaptureManager::new();
        manager.reserve("eth0", handle("a", 0, 0)).unwrap();
        let err = manager.reserve("eth0", handle("b", 0, 0)).unwrap_err();
        assert!(matches!(err, AgentError::Resource(_)));
        // A different interface is fine.
        manager.reserve("eth1", handle("a", 0, 0)).unwrap();
    }

    #[test]
    fn test_stop_releases_slot_and_sums_counters() {
        let manager = CaptureManager::new();
        let h = handle("node-1", 10, 1000);
        let cancel = h.cancel.clone();
        manager.reserve("eth0", h).unwrap();
        manager.reserve("eth1", handle("node-1", 5, 500)).unwrap();
        manager.reserve("eth2", handle("node-2", 99, 9)).unwrap();

        let stats = manager.stop("node-1");
        assert_eq!(stats.packets_received, 15);
        assert_eq!(stats.bytes_received, 1500);
        assert!(cancel.is_cancelled());

        // Slots freed for node-1 only.
        assert!(manager.reserve("eth0", handle("x", 0, 0)).is_ok());
        assert!(manager.reserve("eth2", handle("x", 0, 0)).is_err());
    }

    #[test]
    fn test_empty_interface_rejected() {
        let manager = CaptureManager::new();
        let err = manager.start(&CaptureRequest::default()).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
