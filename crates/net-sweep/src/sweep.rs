//! Periodic network sweep service.
//!
//! Drives the combined scanner over the configured networks on a repeating
//! cycle, aggregating per-host and per-port availability. The previous
//! cycle's summary stays queryable while the next cycle runs; the fresh
//! summary is swapped in atomically at cycle end. Scheduling is post-cycle
//! sleep: the next cycle starts `interval - elapsed` after the previous one
//! finished, so overruns never pile up.

use crate::combined::CombinedScanner;
use crate::duration::Duration as JsonDuration;
use crate::error::SweepError;
use crate::icmp;
use crate::target::{self, SweepMode, SweepResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CONCURRENCY: usize = 25;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ICMP_COUNT: u32 = 2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// On-disk sweep configuration (`sweep/sweep.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub sweep_modes: Vec<SweepMode>,
    #[serde(default)]
    pub interval: JsonDuration,
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub timeout: JsonDuration,
    #[serde(default)]
    pub icmp_count: u32,
    /// Connection reuse knobs, accepted for config compatibility.
    #[serde(default)]
    pub max_idle: usize,
    #[serde(default)]
    pub max_lifetime: JsonDuration,
    #[serde(default)]
    pub idle_timeout: JsonDuration,
}

impl SweepConfig {
    /// Replace zero-valued fields with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = JsonDuration(DEFAULT_INTERVAL);
        }
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.timeout.is_zero() {
            self.timeout = JsonDuration(DEFAULT_TIMEOUT);
        }
        if self.icmp_count == 0 {
            self.icmp_count = DEFAULT_ICMP_COUNT;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Aggregated summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortCount {
    pub port: u16,
    pub available: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub host: String,
    pub available: bool,
    pub first_seen: u64,
    pub last_seen: u64,
    pub response_time_ns: u64,
}

/// One cycle's aggregated view, published atomically at cycle end.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub network: String,
    pub total_hosts: u64,
    pub available_hosts: u64,
    /// Epoch seconds of cycle completion.
    pub last_sweep: u64,
    pub ports: Vec<PortCount>,
    pub hosts: Vec<HostSummary>,
    pub total_results: u64,
    pub icmp_success: u64,
    pub tcp_success: u64,
}

struct HostInfo {
    available: bool,
    response_time: Duration,
    last_seen: u64,
}

/// Per-cycle accumulation, mutated only by the sweep loop.
#[derive(Default)]
struct CycleState {
    unique_hosts: HashSet<String>,
    available_hosts: HashSet<String>,
    per_port: HashMap<u16, u64>,
    icmp_success: u64,
    tcp_success: u64,
    total_results: u64,
    host_info: HashMap<String, HostInfo>,
}

impl CycleState {
    fn record(&mut self, result: &SweepResult) {
        self.total_results += 1;
        self.unique_hosts.insert(result.target.host.clone());

        if result.available {
            self.available_hosts.insert(result.target.host.clone());
            match result.target.mode {
                SweepMode::Tcp => {
                    if let Some(port) = result.target.port {
                        *self.per_port.entry(port).or_insert(0) += 1;
                    }
                    self.tcp_success += 1;
                }
                SweepMode::Icmp => self.icmp_success += 1,
            }
        }

        let last_seen = epoch_secs(result.last_seen);
        let info = self
            .host_info
            .entry(result.target.host.clone())
            .or_insert(HostInfo {
                available: false,
                response_time: Duration::ZERO,
                last_seen,
            });
        info.last_seen = last_seen;
        if result.available {
            info.available = true;
            if info.response_time.is_zero() || result.response_time < info.response_time {
                info.response_time = result.response_time;
            }
        }
    }

    fn into_summary(
        self,
        config: &SweepConfig,
        first_seen: &mut HashMap<String, u64>,
    ) -> SweepSummary {
        let now = epoch_secs(SystemTime::now());

        let mut hosts: Vec<HostSummary> = self
            .host_info
            .into_iter()
            .map(|(host, info)| {
                let first = *first_seen.entry(host.clone()).or_insert(now);
                HostSummary {
                    host,
                    available: info.available,
                    first_seen: first,
                    last_seen: info.last_seen,
                    response_time_ns: info.response_time.as_nanos() as u64,
                }
            })
            .collect();
        hosts.sort_by(|a, b| target::compare_ip_strings(&a.host, &b.host));

        let ports = config
            .ports
            .iter()
            .map(|&port| PortCount {
                port,
                available: self.per_port.get(&port).copied().unwrap_or(0),
            })
            .collect();

        SweepSummary {
            network: config.networks.join(","),
            total_hosts: self.unique_hosts.len() as u64,
            available_hosts: self.available_hosts.len() as u64,
            last_sweep: now,
            ports,
            hosts,
            total_results: self.total_results,
            icmp_success: self.icmp_success,
            tcp_success: self.tcp_success,
        }
    }
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

// ---------------------------------------------------------------------------
// Sweep service
// ---------------------------------------------------------------------------

/// Long-running sweep driver exposed to the agent as the `sweep` pseudo-type.
pub struct SweepService {
    config: Mutex<SweepConfig>,
    /// Staged by `update_config`, applied at the next cycle boundary.
    pending: Mutex<Option<SweepConfig>>,
    summary: RwLock<Arc<SweepSummary>>,
    first_seen: Mutex<HashMap<String, u64>>,
    started: AtomicBool,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SweepService {
    /// A missing config means all defaults.
    pub fn new(config: Option<SweepConfig>) -> Arc<Self> {
        Arc::new(SweepService {
            config: Mutex::new(config.unwrap_or_default().normalized()),
            pending: Mutex::new(None),
            summary: RwLock::new(Arc::new(SweepSummary::default())),
            first_seen: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        })
    }

    /// Begin the sweep loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Fresh run: forget the previous run's published state.
        *self.summary.write().unwrap() = Arc::new(SweepSummary::default());
        self.first_seen.lock().unwrap().clear();

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let service = self.clone();
        let handle = tokio::spawn(async move {
            service.run_loop(cancel).await;
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cancel the current cycle, drain it, and stop the loop.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.lock().unwrap().cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Swap in a new config at the next cycle boundary.
    pub fn update_config(&self, config: SweepConfig) {
        *self.pending.lock().unwrap() = Some(config);
    }

    /// Snapshot of the most recently completed cycle.
    pub fn summary(&self) -> Arc<SweepSummary> {
        self.summary.read().unwrap().clone()
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("sweep loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(new) = self.pending.lock().unwrap().take() {
                info!("sweep config updated");
                *self.config.lock().unwrap() = new.normalized();
            }
            let config = self.config.lock().unwrap().clone();

            let started_at = Instant::now();
            match run_cycle(&config, &cancel, &self.first_seen).await {
                // A cancelled cycle is drained but its partial view is not published.
                Ok(_) if cancel.is_cancelled() => break,
                Ok(summary) => {
                    info!(
                        "sweep cycle done: {}/{} hosts up, {} results",
                        summary.available_hosts, summary.total_hosts, summary.total_results
                    );
                    *self.summary.write().unwrap() = Arc::new(summary);
                }
                // A bad network definition skips the cycle, it does not kill the loop.
                Err(e) => warn!("sweep cycle skipped: {e}"),
            }

            let wait = config.interval.saturating_sub(started_at.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("sweep loop stopped");
    }
}

async fn run_cycle(
    config: &SweepConfig,
    cancel: &CancellationToken,
    first_seen: &Mutex<HashMap<String, u64>>,
) -> Result<SweepSummary, SweepError> {
    let targets = target::generate_targets(&config.networks, &config.ports, &config.sweep_modes)?;
    let scanner = CombinedScanner::new(
        config.timeout.0,
        config.concurrency,
        config.icmp_count,
        icmp::DEFAULT_RATE_LIMIT,
    );

    let mut rx = scanner.scan(targets, cancel)?;
    let mut state = CycleState::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                scanner.stop();
                break;
            }
            result = rx.recv() => match result {
                Some(result) => state.record(&result),
                None => break,
            }
        }
    }

    Ok(state.into_summary(config, &mut first_seen.lock().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use tokio::net::TcpListener;

    fn tcp_hit(host: &str, port: u16) -> SweepResult {
        SweepResult::hit(Target::tcp(host, port), Duration::from_millis(3))
    }

    #[test]
    fn test_zero_config_normalizes_to_defaults() {
        let config = SweepConfig::default().normalized();
        assert_eq!(config.interval.0, Duration::from_secs(900));
        assert_eq!(config.concurrency, 25);
        assert_eq!(config.timeout.0, Duration::from_secs(5));
        assert_eq!(config.icmp_count, 2);
    }

    #[test]
    fn test_explicit_values_survive_normalization() {
        let config = SweepConfig {
            concurrency: 3,
            icmp_count: 5,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.icmp_count, 5);
    }

    #[test]
    fn test_aggregation_rules() {
        let mut state = CycleState::default();
        state.record(&tcp_hit("10.0.0.1", 80));
        state.record(&tcp_hit("10.0.0.1", 443));
        state.record(&SweepResult::hit(Target::icmp("10.0.0.2"), Duration::from_millis(1)));
        state.record(&SweepResult::miss(Target::icmp("10.0.0.3"), "no reply"));

        assert_eq!(state.total_results, 4);
        assert_eq!(state.unique_hosts.len(), 3);
        assert_eq!(state.available_hosts.len(), 2);
        assert_eq!(state.per_port[&80], 1);
        assert_eq!(state.per_port[&443], 1);
        assert_eq!(state.tcp_success, 2);
        assert_eq!(state.icmp_success, 1);
    }

    #[test]
    fn test_summary_ports_and_sorted_hosts() {
        let config = SweepConfig {
            networks: vec!["10.0.0.0/24".to_string()],
            ports: vec![80, 22],
            ..Default::default()
        };
        let mut state = CycleState::default();
        state.record(&tcp_hit("10.0.0.10", 80));
        state.record(&tcp_hit("10.0.0.2", 80));
        state.record(&SweepResult::miss(Target::tcp("10.0.0.1", 22), "closed"));

        let mut first_seen = HashMap::new();
        let summary = state.into_summary(&config, &mut first_seen);

        assert_eq!(summary.network, "10.0.0.0/24");
        assert_eq!(summary.total_hosts, 3);
        assert_eq!(summary.available_hosts, 2);
        assert_eq!(summary.ports.len(), 2);
        assert_eq!(summary.ports[0].port, 80);
        assert_eq!(summary.ports[0].available, 2);
        assert_eq!(summary.ports[1].available, 0);
        let hosts: Vec<&str> = summary.hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.10"]);
        assert!(summary.last_sweep > 0);
    }

    #[test]
    fn test_first_seen_is_stable_across_cycles() {
        let config = SweepConfig::default();
        let mut first_seen = HashMap::new();
        first_seen.insert("10.0.0.1".to_string(), 1111);

        let mut state = CycleState::default();
        state.record(&tcp_hit("10.0.0.1", 80));
        let summary = state.into_summary(&config, &mut first_seen);
        assert_eq!(summary.hosts[0].first_seen, 1111);
    }

    #[tokio::test]
    async fn test_single_host_tcp_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = SweepConfig {
            networks: vec!["127.0.0.1/32".to_string()],
            ports: vec![port],
            sweep_modes: vec![SweepMode::Tcp],
            ..Default::default()
        }
        .normalized();

        let first_seen = Mutex::new(HashMap::new());
        let cancel = CancellationToken::new();
        let summary = run_cycle(&config, &cancel, &first_seen).await.unwrap();

        assert_eq!(summary.total_hosts, 1);
        assert_eq!(summary.available_hosts, 1);
        assert_eq!(summary.ports.len(), 1);
        assert_eq!(summary.ports[0].port, port);
        assert_eq!(summary.ports[0].available, 1);
        assert_eq!(summary.tcp_success, 1);
    }

    #[tokio::test]
    async fn test_invalid_network_skips_cycle() {
        let config = SweepConfig {
            networks: vec!["not-a-cidr".to_string()],
            sweep_modes: vec![SweepMode::Tcp],
            ..Default::default()
        }
        .normalized();

        let first_seen = Mutex::new(HashMap::new());
        let cancel = CancellationToken::new();
        assert!(run_cycle(&config, &cancel, &first_seen).await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_applies_at_cycle_boundary() {
        let service = SweepService::new(None);
        service.update_config(SweepConfig {
            networks: vec!["10.9.9.0/24".to_string()],
            concurrency: 7,
            ..Default::default()
        });

        // Staged, not yet effective.
        assert!(service.config.lock().unwrap().networks.is_empty());

        // What the loop does at the boundary.
        let pending = service.pending.lock().unwrap().take().unwrap();
        *service.config.lock().unwrap() = pending.normalized();

        let config = service.config.lock().unwrap().clone();
        assert_eq!(config.networks, vec!["10.9.9.0/24"]);
        assert_eq!(config.concurrency, 7);
        assert_eq!(config.icmp_count, 2);
    }

    #[tokio::test]
    async fn test_start_stop_start_resets_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = SweepConfig {
            networks: vec!["127.0.0.1/32".to_string()],
            ports: vec![port],
            sweep_modes: vec![SweepMode::Tcp],
            interval: JsonDuration::from_millis(50),
            ..Default::default()
        };
        let service = SweepService::new(Some(config));

        service.start();
        service.start(); // idempotent

        // Wait for the first cycle to publish.
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.summary().total_results == 0 {
            assert!(Instant::now() < deadline, "no cycle completed in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        service.stop().await;
        service.stop().await; // idempotent

        service.start();
        // Restart resets the published state before the new loop is polled.
        assert_eq!(service.summary().total_results, 0);
        service.stop().await;
    }
}
