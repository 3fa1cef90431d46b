//! Status dispatcher: checker cache and request resolution.
//!
//! Requests resolve in order: live cached checker, then a named on-disk
//! checker config, then the registry by service type. The cache is keyed
//! on `(service_type, service_name, details)` and the lock is held across
//! factory execution, so at most one instance ever exists per key and
//! losers of a would-be race never get built. `check` itself always runs
//! outside the lock.

use crate::checker::{CheckResult, Checker, CheckerContext, Registry};
use crate::config::CheckerConfig;
use crate::error::Result;
use net_sweep::SweepService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

pub const SWEEP_SERVICE_TYPE: &str = "sweep";
pub const SWEEP_SERVICE_NAME: &str = "network_sweep";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckerKey {
    pub service_type: String,
    pub service_name: String,
    pub details: String,
}

#[derive(Debug, Clone)]
pub struct StatusReply {
    pub available: bool,
    pub message: String,
    pub service_name: String,
    pub service_type: String,
}

pub struct Dispatcher {
    registry: Registry,
    ctx: Arc<CheckerContext>,
    configs: HashMap<String, CheckerConfig>,
    cache: Mutex<HashMap<CheckerKey, Arc<dyn Checker>>>,
    sweep: Option<Arc<SweepService>>,
    check_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        ctx: Arc<CheckerContext>,
        configs: HashMap<String, CheckerConfig>,
        sweep: Option<Arc<SweepService>>,
    ) -> Self {
        Dispatcher {
            registry,
            ctx,
            configs,
            cache: Mutex::new(HashMap::new()),
            sweep,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Answer one status request; the `sweep` pseudo-type short-circuits to
    /// the sweep service. `caller_timeout` is whatever deadline the caller
    /// attached to the RPC; the check runs under the tighter of it and the
    /// dispatch default.
    pub async fn get_status(
        &self,
        service_type: &str,
        service_name: &str,
        details: &str,
        port: i32,
        caller_timeout: Option<Duration>,
    ) -> Result<StatusReply> {
        if service_type == SWEEP_SERVICE_TYPE {
            return Ok(self.sweep_status());
        }

        let details = effective_details(service_type, details, port);
        let checker = self
            .resolve(service_type, service_name, &details)
            .await?;

        // Check runs outside the cache lock, bounded by min(caller, default).
        let timeout = match caller_timeout {
            Some(remaining) => remaining.min(self.check_timeout),
            None => self.check_timeout,
        };
        let result = match tokio::time::timeout(timeout, checker.check()).await {
            Ok(result) => result,
            Err(_) => CheckResult::error(format!(
                "check for {service_name} timed out after {timeout:?}"
            )),
        };

        Ok(StatusReply {
            available: result.available,
            message: result.message,
            service_name: service_name.to_string(),
            service_type: service_type.to_string(),
        })
    }

    /// Cached checker for the key, building one on first use.
    pub async fn resolve(
        &self,
        service_type: &str,
        service_name: &str,
        details: &str,
    ) -> Result<Arc<dyn Checker>> {
        let key = CheckerKey {
            service_type: service_type.to_string(),
            service_name: service_name.to_string(),
            details: details.to_string(),
        };

        let mut cache = self.cache.lock().await;
        if let Some(checker) = cache.get(&key) {
            return Ok(checker.clone());
        }

        let checker = match self.configs.get(service_name) {
            Some(config) => {
                let build_details = if details.is_empty() {
                    config.endpoint().unwrap_or_default()
                } else {
                    details.to_string()
                };
                self.registry
                    .build(self.ctx.clone(), &config.checker_type, service_name, &build_details)
                    .await?
            }
            None => {
                self.registry
                    .build(self.ctx.clone(), service_type, service_name, details)
                    .await?
            }
        };

        cache.insert(key, checker.clone());
        Ok(checker)
    }

    /// Seed the cache with a pre-built checker (startup pre-dialing).
    pub async fn insert(&self, key: CheckerKey, checker: Arc<dyn Checker>) {
        let mut cache = self.cache.lock().await;
        // First insert wins; a racing loser is closed instead of cached.
        if cache.contains_key(&key) {
            if let Err(e) = checker.close().await {
                warn!("close duplicate checker {key:?}: {e}");
            }
            return;
        }
        cache.insert(key, checker);
    }

    fn sweep_status(&self) -> StatusReply {
        match &self.sweep {
            None => StatusReply {
                available: false,
                message: "Sweep service not configured".to_string(),
                service_name: SWEEP_SERVICE_NAME.to_string(),
                service_type: SWEEP_SERVICE_TYPE.to_string(),
            },
            Some(sweep) => {
                let summary = sweep.summary();
                let message = serde_json::to_string(&*summary)
                    .unwrap_or_else(|e| format!("{{\"error\":\"encode summary: {e}\"}}"));
                StatusReply {
                    available: true,
                    message,
                    service_name: SWEEP_SERVICE_NAME.to_string(),
                    service_type: SWEEP_SERVICE_TYPE.to_string(),
                }
            }
        }
    }

    /// Close every cached checker; failures are logged and the last one is
    /// returned.
    pub async fn close_all(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let mut last_err = None;
        for (key, checker) in cache.drain() {
            if let Err(e) = checker.close().await {
                warn!("close checker {}/{}: {e}", key.service_type, key.service_name);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A `port` request may carry the port number in its dedicated field
/// instead of details; loopback is the implied host.
fn effective_details(service_type: &str, details: &str, port: i32) -> String {
    if !details.is_empty() {
        return details.to_string();
    }
    if service_type == "port" && (1..=65535).contains(&port) {
        return format!("127.0.0.1:{port}");
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::security::{SecurityConfig, SecurityProvider};
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn dispatcher(configs: HashMap<String, CheckerConfig>) -> Dispatcher {
        let ctx = Arc::new(CheckerContext {
            security: Arc::new(SecurityProvider::new(&SecurityConfig::default()).unwrap()),
            snmp_config_path: PathBuf::from("/nonexistent/snmp.json"),
        });
        Dispatcher::new(Registry::with_defaults(), ctx, configs, None)
    }

    #[tokio::test]
    async fn test_same_key_reuses_the_instance() {
        let d = dispatcher(HashMap::new());
        let a = d.resolve("port", "SSH", "127.0.0.1:22").await.unwrap();
        let b = d.resolve("port", "SSH", "127.0.0.1:22").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_distinct_details_distinct_instances() {
        let d = dispatcher(HashMap::new());
        let a = d.resolve("port", "SSH", "127.0.0.1:22").await.unwrap();
        let b = d.resolve("port", "SSH", "192.168.1.1:22").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_found() {
        let d = dispatcher(HashMap::new());
        let err = d.get_status("mystery", "svc", "", 0, None).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(t) if t == "mystery"));
    }

    #[tokio::test]
    async fn test_sweep_without_config() {
        let d = dispatcher(HashMap::new());
        let reply = d.get_status("sweep", "anything", "", 0, None).await.unwrap();
        assert!(!reply.available);
        assert_eq!(reply.message, "Sweep service not configured");
        assert_eq!(reply.service_name, "network_sweep");
        assert_eq!(reply.service_type, "sweep");
    }

    #[tokio::test]
    async fn test_resolution_via_named_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config: CheckerConfig = serde_json::from_str(&format!(
            r#"{{"name":"web","type":"port","address":"127.0.0.1","port":{port}}}"#
        ))
        .unwrap();
        let d = dispatcher(HashMap::from([("web".to_string(), config)]));

        let reply = d.get_status("port", "web", "", 0, None).await.unwrap();
        assert!(reply.available);
        let payload: serde_json::Value = serde_json::from_str(&reply.message).unwrap();
        assert_eq!(payload["port"], port);
    }

    #[tokio::test]
    async fn test_port_field_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let d = dispatcher(HashMap::new());
        let reply = d
            .get_status("port", "local", "", i32::from(port), None)
            .await
            .unwrap();
        assert!(reply.available);
    }

    #[tokio::test]
    async fn test_slow_check_is_caught_not_propagated() {
        struct Stuck;
        #[async_trait::async_trait]
        impl Checker for Stuck {
            async fn check(&self) -> CheckResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                CheckResult::up("never")
            }
        }

        let ctx = Arc::new(CheckerContext {
            security: Arc::new(SecurityProvider::new(&SecurityConfig::default()).unwrap()),
            snmp_config_path: PathBuf::from("/nonexistent/snmp.json"),
        });
        let mut registry = Registry::new();
        registry.register("stuck", |_ctx, _name, _details| {
            Box::pin(async { Ok(Arc::new(Stuck) as Arc<dyn Checker>) })
        });

        let d = Dispatcher::new(registry, ctx, HashMap::new(), None)
            .with_check_timeout(Duration::from_millis(50));
        let reply = d.get_status("stuck", "svc", "", 0, None).await.unwrap();
        assert!(!reply.available);
        assert!(reply.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_tighter_caller_deadline_wins() {
        struct Stuck;
        #[async_trait::async_trait]
        impl Checker for Stuck {
            async fn check(&self) -> CheckResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                CheckResult::up("never")
            }
        }

        let ctx = Arc::new(CheckerContext {
            security: Arc::new(SecurityProvider::new(&SecurityConfig::default()).unwrap()),
            snmp_config_path: PathBuf::from("/nonexistent/snmp.json"),
        });
        let mut registry = Registry::new();
        registry.register("stuck", |_ctx, _name, _details| {
            Box::pin(async { Ok(Arc::new(Stuck) as Arc<dyn Checker>) })
        });

        // Default timeout stays at 30 s; the caller's 50 ms bounds the check.
        let d = Dispatcher::new(registry, ctx, HashMap::new(), None);
        let started = std::time::Instant::now();
        let reply = d
            .get_status("stuck", "svc", "", 0, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(!reply.available);
        assert!(reply.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_insert_keeps_first() {
        struct Nop;
        #[async_trait::async_trait]
        impl Checker for Nop {
            async fn check(&self) -> CheckResult {
                CheckResult::up("{}")
            }
        }

        let d = dispatcher(HashMap::new());
        let key = CheckerKey {
            service_type: "grpc".to_string(),
            service_name: "x".to_string(),
            details: "addr".to_string(),
        };
        let first: Arc<dyn Checker> = Arc::new(Nop);
        d.insert(key.clone(), first.clone()).await;
        d.insert(key.clone(), Arc::new(Nop)).await;

        let cached = d.cache.lock().await.get(&key).unwrap().clone();
        assert!(Arc::ptr_eq(&cached, &first));
    }
}
