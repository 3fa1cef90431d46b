//! SNMP checker proxy.
//!
//! SNMP polling lives in an external checker process; this checker reads
//! its own config document, dials that process over the secured transport,
//! and proxies status queries. A background loop re-checks the remote's
//! health every minute, logging failures without escalating them.

use crate::checker::{CheckResult, Checker, CheckerContext};
use crate::error::{AgentError, Result};
use crate::proto::StatusRequest;
use crate::transport::SecureClient;
use async_trait::async_trait;
use net_sweep::duration::Duration as JsonDuration;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// `snmp.json` as the agent reads it; the rest of the document belongs to
/// the external checker process.
#[derive(Debug, Deserialize)]
struct SnmpCheckerConfig {
    address: String,
    #[serde(default)]
    #[allow(dead_code)]
    timeout: Option<JsonDuration>,
}

pub struct SnmpChecker {
    address: String,
    client: Arc<SecureClient>,
    cancel: CancellationToken,
}

impl SnmpChecker {
    pub async fn new(ctx: Arc<CheckerContext>) -> Result<Self> {
        let path = &ctx.snmp_config_path;
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        let config: SnmpCheckerConfig = serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;

        let client = Arc::new(SecureClient::connect(&config.address, &ctx.security).await?);
        let cancel = CancellationToken::new();

        // Health loop: observe, log, never escalate.
        {
            let client = client.clone();
            let cancel = cancel.clone();
            let address = config.address.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(HEALTH_INTERVAL) => {}
                    }
                    match client.check_health("").await {
                        Ok(true) => debug!("snmp checker {address} healthy"),
                        Ok(false) => warn!("snmp checker {address} reports not serving"),
                        Err(e) => warn!("snmp checker {address} health check failed: {e}"),
                    }
                }
            });
        }

        Ok(SnmpChecker {
            address: config.address,
            client,
            cancel,
        })
    }
}

#[async_trait]
impl Checker for SnmpChecker {
    async fn check(&self) -> CheckResult {
        let request = StatusRequest {
            service_name: "snmp".to_string(),
            service_type: "snmp".to_string(),
            ..Default::default()
        };
        match self.client.get_status(request).await {
            Ok(response) => CheckResult {
                available: response.available,
                message: response.message,
            },
            Err(e) => CheckResult::error(format!("snmp status from {}: {e}", self.address)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityConfig, SecurityProvider};

    fn ctx_with_path(path: std::path::PathBuf) -> Arc<CheckerContext> {
        Arc::new(CheckerContext {
            security: Arc::new(SecurityProvider::new(&SecurityConfig::default()).unwrap()),
            snmp_config_path: path,
        })
    }

    #[tokio::test]
    async fn test_missing_config_file_is_config_error() {
        let err = SnmpChecker::new(ctx_with_path("/nonexistent/snmp.json".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_malformed_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snmp.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = SnmpChecker::new(ctx_with_path(path)).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_config_shape() {
        let config: SnmpCheckerConfig =
            serde_json::from_str(r#"{"address":"127.0.0.1:50054","timeout":"30s"}"#).unwrap();
        assert_eq!(config.address, "127.0.0.1:50054");
    }
}
