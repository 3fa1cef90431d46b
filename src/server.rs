//! The agent's gRPC surface and lifecycle.
//!
//! Startup wires config discovery, the checker registry, the dispatcher,
//! the sweep service, and capture into one [`AgentServer`], then serves
//! `AgentService` plus the standard health service on the configured
//! listen address. Shutdown closes cached checkers, cancels the sweep,
//! and lets the transport finish its graceful stop.

use crate::capture::CaptureManager;
use crate::checker::{CheckerContext, Registry};
use crate::config::{self, ServerConfig};
use crate::dispatcher::{CheckerKey, Dispatcher};
use crate::error::{AgentError, Result};
use crate::grpc_checker::ExternalChecker;
use crate::proto::{
    AgentService, AgentServiceServer, CaptureRequest, CaptureStats, PacketData, StatusRequest,
    StatusResponse, StopCaptureRequest,
};
use crate::security::SecurityProvider;
use crate::transport::{self, GrpcServer};
use futures_util::Stream;
use net_sweep::SweepService;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

/// Status messages stay printable and bounded.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

pub struct AgentServer {
    config: ServerConfig,
    security: Arc<SecurityProvider>,
    dispatcher: Arc<Dispatcher>,
    sweep: Option<Arc<SweepService>>,
    capture: CaptureManager,
    cancel: CancellationToken,
}

impl AgentServer {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let security = Arc::new(SecurityProvider::new(&config.security)?);

        let checker_configs =
            config::discover_checker_configs(&config.checkers_dir, &config.listen_addr)?;
        info!(
            "discovered {} checker config(s) in {}",
            checker_configs.len(),
            config.checkers_dir.display()
        );

        let sweep = config::load_sweep_config(&config.sweep_config_path())?
            .map(|sweep_config| SweepService::new(Some(sweep_config)));

        let registry = Registry::with_defaults();
        for (name, checker_config) in &checker_configs {
            if !registry.contains(&checker_config.checker_type) {
                warn!(
                    "checker config {name} references unknown type {:?}",
                    checker_config.checker_type
                );
            }
        }

        let ctx = Arc::new(CheckerContext {
            security: security.clone(),
            snmp_config_path: config.snmp_config_path(),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            ctx.clone(),
            checker_configs.clone(),
            sweep.clone(),
        ));

        // Warm up remote checkers. A dead endpoint is a warning; the poller
        // will see it as unavailable when it actually asks.
        for (name, checker_config) in &checker_configs {
            if checker_config.checker_type != "grpc" {
                continue;
            }
            let Some(endpoint) = checker_config.endpoint() else {
                continue;
            };
            match ExternalChecker::new(ctx.clone(), name.clone(), endpoint.clone()).await {
                Ok(checker) => {
                    dispatcher
                        .insert(
                            CheckerKey {
                                service_type: "grpc".to_string(),
                                service_name: name.clone(),
                                details: endpoint.clone(),
                            },
                            Arc::new(checker),
                        )
                        .await;
                    info!("pre-dialed grpc checker {name} at {endpoint}");
                }
                Err(e) => warn!("pre-dial grpc checker {name} at {endpoint}: {e}"),
            }
        }

        Ok(Arc::new(AgentServer {
            config,
            security,
            dispatcher,
            sweep,
            capture: CaptureManager::new(),
            cancel: CancellationToken::new(),
        }))
    }

    /// Serve until [`stop`] fires.
    ///
    /// [`stop`]: AgentServer::stop
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listen_addr: SocketAddr = self.config.listen_addr.parse().map_err(|e| {
            AgentError::Config(format!(
                "invalid listen_addr {:?}: {e}",
                self.config.listen_addr
            ))
        })?;

        let mut grpc = GrpcServer::new(listen_addr);
        grpc.register_health_service()?;

        if let Some(sweep) = &self.sweep {
            sweep.start();
        }

        grpc.serve(
            AgentServiceServer::new(AgentRpc {
                server: self.clone(),
            }),
            &self.security,
            self.cancel.clone(),
        )
        .await
    }

    /// Release checkers, cancel the sweep and captures, and signal done.
    pub async fn stop(&self) {
        info!("agent stopping");
        if let Err(e) = self.dispatcher.close_all().await {
            warn!("closing checkers: {e}");
        }
        if let Some(sweep) = &self.sweep {
            sweep.stop().await;
        }
        self.capture.stop_all();
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// RPC handlers
// ---------------------------------------------------------------------------

struct AgentRpc {
    server: Arc<AgentServer>,
}

#[tonic::async_trait]
impl AgentService for AgentRpc {
    async fn get_status(
        &self,
        request: Request<StatusRequest>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let server = self.server.clone();
        transport::recover(async move {
            let caller_timeout = transport::caller_timeout(request.metadata());
            let req = request.into_inner();
            let reply = server
                .dispatcher
                .get_status(
                    &req.service_type,
                    &req.service_name,
                    &req.details,
                    req.port,
                    caller_timeout,
                )
                .await
                .map_err(Status::from)?;
            Ok(Response::new(StatusResponse {
                available: reply.available,
                message: clamp_message(reply.message),
                service_name: reply.service_name,
                service_type: reply.service_type,
            }))
        })
        .await
    }

    type StartCaptureStream =
        Pin<Box<dyn Stream<Item = std::result::Result<PacketData, Status>> + Send>>;

    async fn start_capture(
        &self,
        request: Request<CaptureRequest>,
    ) -> std::result::Result<Response<Self::StartCaptureStream>, Status> {
        let server = self.server.clone();
        transport::recover(async move {
            let req = request.into_inner();
            let rx = server.capture.start(&req).map_err(Status::from)?;
            let stream = ReceiverStream::new(rx).map(Ok);
            Ok(Response::new(
                Box::pin(stream) as Self::StartCaptureStream
            ))
        })
        .await
    }

    async fn stop_capture(
        &self,
        request: Request<StopCaptureRequest>,
    ) -> std::result::Result<Response<CaptureStats>, Status> {
        let server = self.server.clone();
        transport::recover(async move {
            let req = request.into_inner();
            Ok(Response::new(server.capture.stop(&req.node_id)))
        })
        .await
    }
}

/// Truncate to the 64 KiB cap on a char boundary.
fn clamp_message(message: String) -> String {
    if message.len() <= MAX_MESSAGE_BYTES {
        return message;
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn test_server_at(listen_addr: &str) -> Arc<AgentServer> {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            listen_addr: listen_addr.to_string(),
            checkers_dir: dir.path().to_path_buf(),
            security: Default::default(),
            snmp_config_path: None,
        };
        AgentServer::new(config).await.unwrap()
    }

    async fn test_server() -> Arc<AgentServer> {
        test_server_at("127.0.0.1:0").await
    }

    #[test]
    fn test_clamp_message() {
        assert_eq!(clamp_message("short".to_string()), "short");
        let long = "x".repeat(MAX_MESSAGE_BYTES + 10);
        assert_eq!(clamp_message(long).len(), MAX_MESSAGE_BYTES);
        // Multi-byte chars never split.
        let wide = "é".repeat(MAX_MESSAGE_BYTES);
        let clamped = clamp_message(wide);
        assert!(clamped.len() <= MAX_MESSAGE_BYTES);
        assert!(std::str::from_utf8(clamped.as_bytes()).is_ok());
    }

    #[tokio::test]
    async fn test_get_status_sweep_not_configured() {
        let rpc = AgentRpc {
            server: test_server().await,
        };
        let response = rpc
            .get_status(Request::new(StatusRequest {
                service_type: "sweep".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.available);
        assert_eq!(response.message, "Sweep service not configured");
        assert_eq!(response.service_name, "network_sweep");
    }

    #[tokio::test]
    async fn test_get_status_port_happy_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let rpc = AgentRpc {
            server: test_server().await,
        };
        let response = rpc
            .get_status(Request::new(StatusRequest {
                service_type: "port".to_string(),
                service_name: "ssh".to_string(),
                details: format!("127.0.0.1:{port}"),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.available);
        let payload: serde_json::Value = serde_json::from_str(&response.message).unwrap();
        assert_eq!(payload["port"], port);
        assert!(payload["response_time"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_get_status_unknown_type_is_rpc_error() {
        let rpc = AgentRpc {
            server: test_server().await,
        };
        let status = rpc
            .get_status(Request::new(StatusRequest {
                service_type: "mystery".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_start_capture_requires_interface() {
        let rpc = AgentRpc {
            server: test_server().await,
        };
        let status = rpc
            .start_capture(Request::new(CaptureRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_server_round_trip_with_health() {
        use crate::security::{SecurityConfig, SecurityProvider};
        use crate::transport::SecureClient;
        use std::time::{Duration, Instant};

        // Grab a free port, then hand it to the server.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = test_server_at(&addr.to_string()).await;
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let provider = SecurityProvider::new(&SecurityConfig::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let client = loop {
            match SecureClient::connect(&addr.to_string(), &provider).await {
                Ok(client) => break client,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("server never came up: {e}"),
            }
        };

        assert!(client.check_health("").await.unwrap());

        let response = client
            .get_status(StatusRequest {
                service_type: "sweep".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!response.available);
        assert_eq!(response.message, "Sweep service not configured");

        server.stop().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_capture_with_nothing_running() {
        let rpc = AgentRpc {
            server: test_server().await,
        };
        let stats = rpc
            .stop_capture(Request::new(StopCaptureRequest {
                node_id: "node-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.bytes_received, 0);
    }
}
