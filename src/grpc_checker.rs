//! Remote gRPC checker proxy.
//!
//! Delegates to a checker process hosted behind the secured transport. The
//! remote's `message` is the authoritative status payload and is passed
//! through verbatim once it proves to be JSON.

use crate::checker::{CheckResult, Checker, CheckerContext};
use crate::error::{AgentError, Result};
use crate::proto::StatusRequest;
use crate::transport::SecureClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct ExternalChecker {
    name: String,
    address: String,
    client: SecureClient,
}

impl ExternalChecker {
    /// Dial the remote checker and require it healthy up front; a dead
    /// endpoint fails construction rather than caching a broken checker.
    pub async fn new(ctx: Arc<CheckerContext>, name: String, details: String) -> Result<Self> {
        if details.is_empty() {
            return Err(AgentError::validation(
                "grpc checker requires an address in details",
            ));
        }
        let client = SecureClient::connect(&details, &ctx.security).await?;
        if !client.check_health("").await? {
            return Err(AgentError::transport(format!(
                "initial health check failed for {details}"
            )));
        }
        Ok(ExternalChecker {
            name,
            address: details,
            client,
        })
    }
}

#[async_trait]
impl Checker for ExternalChecker {
    async fn check(&self) -> CheckResult {
        match self.client.check_health("").await {
            Ok(true) => {}
            Ok(false) => {
                return CheckResult::error(format!("{} reports not serving", self.address))
            }
            Err(e) => {
                return CheckResult::error(format!("health check for {}: {e}", self.address))
            }
        }

        let request = StatusRequest {
            service_name: self.name.clone(),
            service_type: "grpc".to_string(),
            ..Default::default()
        };
        let started = Instant::now();
        let response = match self.client.get_status(request).await {
            Ok(response) => response,
            Err(e) => return CheckResult::error(format!("get status from {}: {e}", self.address)),
        };
        debug!(
            "external checker {} answered in {:?}",
            self.address,
            started.elapsed()
        );

        // The remote owns the payload; just verify it is JSON before
        // passing it through untouched.
        if serde_json::from_str::<serde_json::Value>(&response.message).is_err() {
            return CheckResult::error(format!(
                "{} returned a non-JSON status payload",
                self.address
            ));
        }

        CheckResult {
            available: response.available,
            message: response.message,
        }
    }

    async fn close(&self) -> Result<()> {
        // Dropping the client closes the underlying channel; nothing else
        // to release, and repeat calls stay harmless.
        Ok(())
    }
}
