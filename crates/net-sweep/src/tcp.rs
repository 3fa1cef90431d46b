//! Concurrency-bounded TCP connect scanner.
//!
//! Each target gets one connect attempt under the per-connect timeout; RTT
//! is measured from connect start to completion and the stream is closed
//! immediately. A semaphore caps the number of dials in flight.

use crate::target::{SweepResult, Target};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct TcpScanner {
    timeout: Duration,
    concurrency: usize,
}

impl TcpScanner {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        TcpScanner {
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Scan the given targets, streaming one [`SweepResult`] per target.
    ///
    /// The channel closes once every dial has finished or the token is
    /// cancelled; cancellation also stops launching new dials.
    pub fn scan(
        &self,
        targets: Vec<Target>,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<SweepResult> {
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let connect_timeout = self.timeout;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut dials = JoinSet::new();
            for target in targets {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                let tx = tx.clone();
                let cancel = cancel.clone();
                dials.spawn(async move {
                    let result = tokio::select! {
                        result = probe(&target, connect_timeout) => result,
                        _ = cancel.cancelled() => return,
                    };
                    let _ = tx.send(result).await;
                    drop(permit);
                });
            }
            while dials.join_next().await.is_some() {}
        });

        rx
    }
}

async fn probe(target: &Target, connect_timeout: Duration) -> SweepResult {
    let port = target.port.unwrap_or_default();
    let addr = format!("{}:{}", target.host, port);
    let started = Instant::now();

    match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let rtt = started.elapsed();
            drop(stream);
            debug!("tcp {addr} open ({rtt:?})");
            SweepResult::hit(target.clone(), rtt)
        }
        Ok(Err(e)) => SweepResult::miss(target.clone(), format!("connect failed: {e}")),
        Err(_) => SweepResult::miss(target.clone(), "connect timed out"),
    }
}
