//! Single-host ICMP reachability checker.
//!
//! Owns its sweeper, constructed lazily on the first check so that agents
//! without ICMP checks never touch a raw socket. Empty `details` probes
//! loopback.

use crate::checker::{CheckResult, Checker};
use crate::error::Result;
use async_trait::async_trait;
use net_sweep::{IcmpSweeper, Target};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_RATE: u32 = 10;

pub struct IcmpChecker {
    host: String,
    sweeper: OnceLock<IcmpSweeper>,
    cancel: CancellationToken,
}

impl IcmpChecker {
    pub fn new(details: &str) -> Self {
        let host = if details.is_empty() {
            "127.0.0.1"
        } else {
            details
        };
        IcmpChecker {
            host: host.to_string(),
            sweeper: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

}

#[async_trait]
impl Checker for IcmpChecker {
    async fn check(&self) -> CheckResult {
        let sweeper = self
            .sweeper
            .get_or_init(|| IcmpSweeper::new(PROBE_TIMEOUT, 1, PROBE_RATE));

        let mut rx = match sweeper.scan(vec![Target::icmp(&self.host)], &self.cancel) {
            Ok(rx) => rx,
            Err(e) => return CheckResult::error(e.to_string()),
        };

        // One target in, one result out; only the first matters.
        match rx.recv().await {
            Some(result) => CheckResult {
                available: result.available,
                message: serde_json::json!({
                    "host": self.host,
                    "response_time": result.response_time.as_nanos() as u64,
                    "packet_loss": result.packet_loss,
                    "available": result.available,
                })
                .to_string(),
            },
            None => CheckResult::error("icmp scan produced no result"),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.get() {
            sweeper.stop();
        }
        self.cancel.cancel();
        Ok(())
    }
}
