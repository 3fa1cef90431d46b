//! TCP port reachability checker.
//!
//! `details` is a `host:port` pair; a check is one context-bound connect
//! with the RTT reported in nanoseconds.

use crate::checker::{CheckResult, Checker};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PortChecker {
    host: String,
    port: u16,
}

impl PortChecker {
    pub fn new(details: &str) -> Result<Self> {
        let (host, port) = parse_host_port(details)?;
        Ok(PortChecker { host, port })
    }

}

fn parse_host_port(details: &str) -> Result<(String, u16)> {
    let (host, port) = details
        .rsplit_once(':')
        .ok_or_else(|| AgentError::validation(format!("expected host:port, got {details:?}")))?;
    if host.is_empty() {
        return Err(AgentError::validation(format!(
            "expected host:port, got {details:?}"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AgentError::validation(format!("invalid port in {details:?}")))?;
    if port == 0 {
        return Err(AgentError::validation(format!(
            "invalid port in {details:?}"
        )));
    }
    Ok((host.to_string(), port))
}

#[async_trait]
impl Checker for PortChecker {
    async fn check(&self) -> CheckResult {
        let addr = format!("{}:{}", self.host, self.port);
        let started = Instant::now();
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let rtt = started.elapsed();
                drop(stream);
                CheckResult::up(
                    serde_json::json!({
                        "host": self.host,
                        "port": self.port,
                        "response_time": rtt.as_nanos() as u64,
                    })
                    .to_string(),
                )
            }
            Ok(Err(e)) => CheckResult::error(format!("connect {addr}: {e}")),
            Err(_) => CheckResult::error(format!("connect {addr}: timed out")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_port_boundaries() {
        assert!(PortChecker::new("127.0.0.1:0").is_err());
        assert!(PortChecker::new("127.0.0.1:65536").is_err());
        assert!(PortChecker::new("127.0.0.1:1").is_ok());
        assert!(PortChecker::new("127.0.0.1:65535").is_ok());
    }

    #[test]
    fn test_malformed_details() {
        assert!(PortChecker::new("").is_err());
        assert!(PortChecker::new("127.0.0.1").is_err());
        assert!(PortChecker::new(":22").is_err());
        assert!(PortChecker::new("host:notaport").is_err());
    }

    #[tokio::test]
    async fn test_open_port_reports_json_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = PortChecker::new(&format!("127.0.0.1:{port}")).unwrap();
        let result = checker.check().await;
        assert!(result.available);

        let payload: serde_json::Value = serde_json::from_str(&result.message).unwrap();
        assert_eq!(payload["port"], port);
        assert_eq!(payload["host"], "127.0.0.1");
        assert!(payload["response_time"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_closed_port_reports_error_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = PortChecker::new(&format!("127.0.0.1:{port}")).unwrap();
        let result = checker.check().await;
        assert!(!result.available);

        let payload: serde_json::Value = serde_json::from_str(&result.message).unwrap();
        assert!(payload.get("error").is_some());
    }
}
