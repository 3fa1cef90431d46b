//! Fan-in of the ICMP and TCP scanners behind one result stream.
//!
//! Targets are split by mode, each sub-scanner runs independently, and
//! their outputs merge into a single channel that closes when both sides
//! are drained. Cancelling the caller's token terminates both sub-scanners
//! and the forwarding tasks.

use crate::error::SweepError;
use crate::icmp::IcmpSweeper;
use crate::target::{SweepMode, SweepResult, Target};
use crate::tcp::TcpScanner;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct CombinedScanner {
    icmp: IcmpSweeper,
    tcp: TcpScanner,
}

impl CombinedScanner {
    pub fn new(timeout: Duration, concurrency: usize, icmp_count: u32, icmp_rate: u32) -> Self {
        CombinedScanner {
            icmp: IcmpSweeper::new(timeout, icmp_count, icmp_rate),
            tcp: TcpScanner::new(timeout, concurrency),
        }
    }

    /// Run both sub-scanners over the mode-partitioned target list.
    ///
    /// An ICMP socket failure fails the whole scan up front (the caller
    /// skips the cycle); TCP-only target lists never touch a raw socket.
    pub fn scan(
        &self,
        targets: Vec<Target>,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<SweepResult>, SweepError> {
        let (icmp_targets, tcp_targets): (Vec<_>, Vec<_>) =
            targets.into_iter().partition(|t| t.mode == SweepMode::Icmp);

        let (tx, rx) = mpsc::channel(512);

        if !icmp_targets.is_empty() {
            let mut sub = self.icmp.scan(icmp_targets, cancel)?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(result) = sub.recv().await {
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }

        if !tcp_targets.is_empty() {
            let mut sub = self.tcp.scan(tcp_targets, cancel);
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(result) = sub.recv().await {
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(rx)
    }

    /// Release the ICMP socket held by any in-flight scan.
    pub fn stop(&self) {
        self.icmp.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_only_scan_merges_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let scanner = CombinedScanner::new(Duration::from_secs(1), 4, 1, 100);
        let cancel = CancellationToken::new();
        let targets = vec![
            Target::tcp("127.0.0.1", port),
            Target::tcp("127.0.0.1", port),
        ];
        let mut rx = scanner.scan(targets, &cancel).unwrap();

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.available));
    }

    #[tokio::test]
    async fn test_empty_target_list_closes_immediately() {
        let scanner = CombinedScanner::new(Duration::from_secs(1), 4, 1, 100);
        let cancel = CancellationToken::new();
        let mut rx = scanner.scan(Vec::new(), &cancel).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
