//! Sweep targets: CIDR expansion, target generation, and IPv4 ordering.
//!
//! A [`Target`] is one address+mode(+port) tuple submitted to a scanner; a
//! [`SweepResult`] is the scanner's verdict for one target. Targets are
//! generated on demand from the configured networks and discarded once their
//! result has been produced.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use crate::error::SweepError;

/// Probe mode for a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    Icmp,
    Tcp,
}

/// One address+mode(+port) tuple submitted to a scanner.
///
/// Invariant: `mode == Tcp` implies `port` is set (1..=65535); `mode == Icmp`
/// implies `port` is absent. The constructors enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub mode: SweepMode,
    pub port: Option<u16>,
    pub metadata: HashMap<String, String>,
}

impl Target {
    pub fn icmp(host: impl Into<String>) -> Self {
        Target {
            host: host.into(),
            mode: SweepMode::Icmp,
            port: None,
            metadata: HashMap::new(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Target {
            host: host.into(),
            mode: SweepMode::Tcp,
            port: Some(port),
            metadata: HashMap::new(),
        }
    }

    fn with_metadata(mut self, network: &str, total_hosts: usize) -> Self {
        self.metadata.insert("network".to_string(), network.to_string());
        self.metadata
            .insert("total_hosts".to_string(), total_hosts.to_string());
        self
    }
}

/// One scanner output tuple for one target.
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub target: Target,
    pub available: bool,
    pub response_time: Duration,
    /// Fraction of probes lost, in `[0, 1]`.
    pub packet_loss: f64,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub error: Option<String>,
}

impl SweepResult {
    pub fn hit(target: Target, response_time: Duration) -> Self {
        let now = SystemTime::now();
        SweepResult {
            target,
            available: true,
            response_time,
            packet_loss: 0.0,
            first_seen: now,
            last_seen: now,
            error: None,
        }
    }

    pub fn miss(target: Target, error: impl Into<String>) -> Self {
        let now = SystemTime::now();
        SweepResult {
            target,
            available: false,
            response_time: Duration::ZERO,
            packet_loss: 1.0,
            first_seen: now,
            last_seen: now,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// CIDR expansion
// ---------------------------------------------------------------------------

/// Expand an IPv4 CIDR into its usable host addresses, ascending.
///
/// `/32` yields the single address; `/31` yields both (RFC 3021); every
/// other prefix excludes the network and broadcast addresses.
pub fn expand_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>, SweepError> {
    // ipnetwork accepts a bare address as /32; the config format does not.
    if !cidr.contains('/') {
        return Err(SweepError::InvalidTarget(format!("invalid CIDR: {cidr:?}")));
    }
    let network: Ipv4Network = cidr
        .parse()
        .map_err(|_| SweepError::InvalidTarget(format!("invalid CIDR: {cidr:?}")))?;

    let hosts = match network.prefix() {
        32 => vec![network.ip()],
        31 => vec![network.network(), network.broadcast()],
        _ => {
            let first = u32::from(network.network()) + 1;
            let last = u32::from(network.broadcast()) - 1;
            (first..=last).map(Ipv4Addr::from).collect()
        }
    };
    Ok(hosts)
}

// ---------------------------------------------------------------------------
// Target generation
// ---------------------------------------------------------------------------

/// Generate sweep targets for the configured networks.
///
/// For each host of each expanded network: one ICMP target when ICMP mode is
/// enabled, and one TCP target per configured port when TCP mode is enabled.
/// Every target carries `network` and `total_hosts` metadata naming its
/// originating CIDR. Emission order is insertion-deterministic.
pub fn generate_targets(
    networks: &[String],
    ports: &[u16],
    modes: &[SweepMode],
) -> Result<Vec<Target>, SweepError> {
    let icmp = modes.contains(&SweepMode::Icmp);
    let tcp = modes.contains(&SweepMode::Tcp);

    let mut targets = Vec::new();
    for network in networks {
        let hosts = expand_cidr(network)?;
        let total = hosts.len();
        for host in &hosts {
            let host = host.to_string();
            if icmp {
                targets.push(Target::icmp(&host).with_metadata(network, total));
            }
            if tcp {
                for &port in ports {
                    targets.push(Target::tcp(&host, port).with_metadata(network, total));
                }
            }
        }
    }
    Ok(targets)
}

// ---------------------------------------------------------------------------
// IPv4 ordering
// ---------------------------------------------------------------------------

/// Compare two strings as IPv4 addresses.
///
/// Strings that do not parse as IPv4 sort lexicographically before every
/// valid address; valid addresses order by their 4-byte numeric value.
pub fn compare_ip_strings(a: &str, b: &str) -> Ordering {
    match (a.parse::<Ipv4Addr>(), b.parse::<Ipv4Addr>()) {
        (Ok(ipa), Ok(ipb)) => u32::from(ipa).cmp(&u32::from(ipb)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Stable in-place sort of host strings in IPv4 order.
pub fn sort_hosts(hosts: &mut [String]) {
    hosts.sort_by(|a, b| compare_ip_strings(a, b));
}
