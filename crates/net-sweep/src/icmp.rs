//! Bounded ICMP echo sweeper over a raw socket.
//!
//! Echo requests are paced on a dedicated sender thread while a receiver
//! thread matches replies by identifier+sequence; both feed a single async
//! result channel. A target completes on its first echo reply or, once all
//! sends have finished, after the configured timeout. Sending `count`
//! probes per target raises the odds of catching a lossy host; the emitted
//! result reflects the first reply.
//!
//! Opening the raw socket needs CAP_NET_RAW (or root); the error from
//! `scan` says so when it fails.

use crate::error::SweepError;
use crate::target::{SweepResult, Target};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Packets per second when the caller does not say otherwise.
pub const DEFAULT_RATE_LIMIT: u32 = 1000;

/// Poll interval for the blocking receive loop.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Payload carried in every echo request; replies echo it back.
const ECHO_PAYLOAD: &[u8; 8] = b"svcradar";

const MAX_REPLY: usize = 1500;

struct Probe {
    index: usize,
    sent_at: Instant,
}

/// Concurrency-bounded ICMP echo sweeper.
pub struct IcmpSweeper {
    timeout: Duration,
    count: u32,
    rate_limit: u32,
    identifier: u16,
    cancel: CancellationToken,
}

impl IcmpSweeper {
    pub fn new(timeout: Duration, count: u32, rate_limit: u32) -> Self {
        IcmpSweeper {
            timeout,
            count: count.max(1),
            rate_limit: rate_limit.max(1),
            identifier: (std::process::id() & 0xffff) as u16,
            cancel: CancellationToken::new(),
        }
    }

    /// Sweep the given targets, streaming one [`SweepResult`] per target.
    ///
    /// The producer side closes the channel once every target has either
    /// replied or timed out. Cancelling `cancel` (or calling [`stop`])
    /// terminates both I/O threads and releases the socket.
    ///
    /// [`stop`]: IcmpSweeper::stop
    pub fn scan(
        &self,
        targets: Vec<Target>,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<SweepResult>, SweepError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            SweepError::Socket(std::io::Error::new(
                e.kind(),
                format!("open raw ICMP socket (needs CAP_NET_RAW): {e}"),
            ))
        })?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let send_socket = socket.try_clone()?;

        let total = targets.len();
        let (tx, rx) = mpsc::channel(total.max(1));
        let targets = Arc::new(targets);
        let pending: Arc<Mutex<HashMap<u16, Probe>>> = Arc::new(Mutex::new(HashMap::new()));
        let done: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let send_done_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let cancels = [self.cancel.clone(), cancel.clone()];

        // Sender: paced echo requests, `count` probes per target.
        {
            let targets = targets.clone();
            let pending = pending.clone();
            let done = done.clone();
            let send_done_at = send_done_at.clone();
            let cancels = cancels.clone();
            let tx = tx.clone();
            let identifier = self.identifier;
            let count = self.count;
            let interval = Duration::from_secs_f64(1.0 / self.rate_limit as f64);

            tokio::task::spawn_blocking(move || {
                'targets: for (i, target) in targets.iter().enumerate() {
                    let ip: Ipv4Addr = match target.host.parse() {
                        Ok(ip) => ip,
                        Err(_) => {
                            done.lock().unwrap().insert(i);
                            let _ = tx.blocking_send(SweepResult::miss(
                                target.clone(),
                                format!("not an IPv4 address: {}", target.host),
                            ));
                            continue;
                        }
                    };
                    for k in 0..count {
                        if cancels.iter().any(|c| c.is_cancelled()) {
                            break 'targets;
                        }
                        let seq = (i as u32 * count + k) as u16;
                        let packet = build_echo_request(identifier, seq, ECHO_PAYLOAD);
                        pending
                            .lock()
                            .unwrap()
                            .insert(seq, Probe { index: i, sent_at: Instant::now() });
                        let dest = SocketAddrV4::new(ip, 0);
                        if let Err(e) = send_socket.send_to(&packet, &dest.into()) {
                            debug!("icmp send to {ip} failed: {e}");
                        }
                        std::thread::sleep(interval);
                    }
                }
                *send_done_at.lock().unwrap() = Some(Instant::now());
            });
        }

        // Receiver: match replies, emit hits immediately, misses at the end.
        {
            let targets = targets.clone();
            let pending = pending.clone();
            let done = done.clone();
            let send_done_at = send_done_at.clone();
            let identifier = self.identifier;
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || {
                let mut buf = [MaybeUninit::<u8>::uninit(); MAX_REPLY];
                loop {
                    if cancels.iter().any(|c| c.is_cancelled()) {
                        break;
                    }
                    if done.lock().unwrap().len() == total {
                        break;
                    }
                    if let Some(end) = *send_done_at.lock().unwrap() {
                        if end.elapsed() > timeout {
                            break;
                        }
                    }

                    let n = match socket.recv(&mut buf) {
                        Ok(n) => n,
                        Err(e)
                            if e.kind() == ErrorKind::WouldBlock
                                || e.kind() == ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            warn!("icmp receive failed: {e}");
                            break;
                        }
                    };
                    // SAFETY: the kernel initialised the first n bytes.
                    let data = unsafe {
                        std::slice::from_raw_parts(buf.as_ptr() as *const u8, n)
                    };

                    let Some((id, seq)) = parse_echo_reply(data) else {
                        continue;
                    };
                    if id != identifier {
                        continue;
                    }
                    let probe = pending.lock().unwrap().remove(&seq);
                    if let Some(probe) = probe {
                        let mut done_set = done.lock().unwrap();
                        if done_set.insert(probe.index) {
                            let rtt = probe.sent_at.elapsed();
                            drop(done_set);
                            let _ = tx.blocking_send(SweepResult::hit(
                                targets[probe.index].clone(),
                                rtt,
                            ));
                        }
                    }
                }

                let done_set = done.lock().unwrap();
                for (i, target) in targets.iter().enumerate() {
                    if !done_set.contains(&i) {
                        let _ = tx
                            .blocking_send(SweepResult::miss(target.clone(), "no ICMP echo reply"));
                    }
                }
            });
        }

        Ok(rx)
    }

    /// Terminate any in-flight scan and release its socket.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Echo packet codec
// ---------------------------------------------------------------------------

/// Build an ICMP echo request (type 8, code 0) with the given id/seq.
fn build_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.extend_from_slice(&[8, 0, 0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Parse an IPv4 datagram holding an ICMP echo reply; returns (id, seq).
///
/// Raw ICMP sockets deliver the full IP packet, so the IHL field decides
/// where the ICMP header starts. Non-reply ICMP types (including our own
/// looped-back requests) return `None`.
fn parse_echo_reply(datagram: &[u8]) -> Option<(u16, u16)> {
    if datagram.len() < 20 {
        return None;
    }
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    if ihl < 20 || datagram.len() < ihl + 8 {
        return None;
    }
    let icmp = &datagram[ihl..];
    if icmp[0] != 0 || icmp[1] != 0 {
        return None;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((id, seq))
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
