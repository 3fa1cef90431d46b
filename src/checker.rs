//! Pluggable checker abstraction and the type-to-factory registry.
//!
//! A [`Checker`] answers "is this one logical service healthy" with a
//! printable status payload. The [`Registry`] maps a `service_type` string
//! to a factory producing the matching variant; factories are side-effect
//! free apart from resources owned by the checker they return, and must
//! not depend on registration order.

use crate::error::{AgentError, Result};
use crate::grpc_checker::ExternalChecker;
use crate::icmp_checker::IcmpChecker;
use crate::port_checker::PortChecker;
use crate::process_checker::ProcessChecker;
use crate::security::SecurityProvider;
use crate::snmp_checker::SnmpChecker;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of one check: availability plus a printable status payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub available: bool,
    pub message: String,
}

impl CheckResult {
    pub fn up(message: impl Into<String>) -> Self {
        CheckResult {
            available: true,
            message: message.into(),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        CheckResult {
            available: false,
            message: message.into(),
        }
    }

    /// JSON `{"error": ...}` payload for failed probes.
    pub fn error(error: impl AsRef<str>) -> Self {
        CheckResult::down(serde_json::json!({ "error": error.as_ref() }).to_string())
    }
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// Probe the service once. Transport and timeout failures fold into an
    /// unavailable result rather than an error.
    async fn check(&self) -> CheckResult;

    /// Release owned resources. Must be idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared dependencies handed to checker factories.
pub struct CheckerContext {
    pub security: Arc<SecurityProvider>,
    pub snmp_config_path: PathBuf,
}

pub type CheckerFactory = Arc<
    dyn Fn(Arc<CheckerContext>, String, String) -> BoxFuture<'static, Result<Arc<dyn Checker>>>
        + Send
        + Sync,
>;

pub struct Registry {
    factories: HashMap<String, CheckerFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: HashMap::new(),
        }
    }

    /// The standard registrations: process, port, icmp, grpc, snmp.
    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();

        registry.register("process", |_ctx, name, details| {
            Box::pin(async move {
                ProcessChecker::new(&name, &details).map(|c| Arc::new(c) as Arc<dyn Checker>)
            })
        });

        registry.register("port", |_ctx, _name, details| {
            Box::pin(async move {
                PortChecker::new(&details).map(|c| Arc::new(c) as Arc<dyn Checker>)
            })
        });

        registry.register("icmp", |_ctx, _name, details| {
            Box::pin(async move { Ok(Arc::new(IcmpChecker::new(&details)) as Arc<dyn Checker>) })
        });

        registry.register("grpc", |ctx, name, details| {
            Box::pin(async move {
                ExternalChecker::new(ctx, name, details)
                    .await
                    .map(|c| Arc::new(c) as Arc<dyn Checker>)
            })
        });

        registry.register("snmp", |ctx, _name, _details| {
            Box::pin(async move {
                SnmpChecker::new(ctx).await.map(|c| Arc::new(c) as Arc<dyn Checker>)
            })
        });

        registry
    }

    pub fn register<F>(&mut self, service_type: &str, factory: F)
    where
        F: Fn(Arc<CheckerContext>, String, String) -> BoxFuture<'static, Result<Arc<dyn Checker>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(service_type.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }

    /// Build a checker for the given type, or `NotFound` if unregistered.
    /// Factory errors propagate unchanged.
    pub async fn build(
        &self,
        ctx: Arc<CheckerContext>,
        service_type: &str,
        name: &str,
        details: &str,
    ) -> Result<Arc<dyn Checker>> {
        let factory = self
            .factories
            .get(service_type)
            .ok_or_else(|| AgentError::NotFound(service_type.to_string()))?;
        factory(ctx, name.to_string(), details.to_string()).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityConfig;

    fn test_ctx() -> Arc<CheckerContext> {
        Arc::new(CheckerContext {
            security: Arc::new(SecurityProvider::new(&SecurityConfig::default()).unwrap()),
            snmp_config_path: PathBuf::from("/nonexistent/snmp.json"),
        })
    }

    #[test]
    fn test_default_registrations_present() {
        let registry = Registry::with_defaults();
        for service_type in ["process", "port", "icmp", "grpc", "snmp"] {
            assert!(registry.contains(service_type), "{service_type}");
        }
        assert!(!registry.contains("sweep"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_found() {
        let registry = Registry::with_defaults();
        let err = registry
            .build(test_ctx(), "bogus", "x", "y")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(t) if t == "bogus"));
    }

    #[tokio::test]
    async fn test_factory_errors_propagate() {
        let registry = Registry::with_defaults();
        let err = registry
            .build(test_ctx(), "port", "web", "no-port-here")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_factories_build_distinct_instances() {
        let registry = Registry::with_defaults();
        let a = registry
            .build(test_ctx(), "port", "ssh", "127.0.0.1:22")
            .await
            .unwrap();
        let b = registry
            .build(test_ctx(), "port", "ssh", "127.0.0.1:22")
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
