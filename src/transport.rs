//! Secured gRPC plumbing: keepalive-tuned channels, a retrying client for
//! remote checkers, and the agent's own server runner.
//!
//! The client retries unary calls with bounded exponential backoff (1 s
//! doubling, capped at 30 s, three attempts) and gives up immediately on
//! non-retryable errors. The server registers at most one health service,
//! flips it to SERVING before accepting traffic, and force-stops five
//! seconds after a graceful shutdown stalls.

use crate::error::{AgentError, Result};
use crate::proto::{AgentServiceClient, StatusRequest, StatusResponse};
use crate::security::SecurityProvider;
use futures_util::FutureExt;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::transport::{Channel, Endpoint, Server};
use tonic_health::pb::health_check_response::ServingStatus as PbServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::ServingStatus;
use tower::Service;
use tracing::{debug, info, warn};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(600);
const GRACEFUL_STOP: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Open a keepalive-tuned channel to `addr`, TLS-wrapped per the provider.
pub async fn connect_channel(addr: &str, provider: &SecurityProvider) -> Result<Channel> {
    let tls = provider.client_tls()?;
    let scheme = if tls.is_some() { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
        .map_err(|e| AgentError::Transport(format!("invalid address {addr:?}: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(DEFAULT_RPC_TIMEOUT)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(false);
    if let Some(tls) = tls {
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| AgentError::Transport(format!("tls config for {addr}: {e}")))?;
    }
    endpoint
        .connect()
        .await
        .map_err(|e| AgentError::Transport(format!("dial {addr}: {e}")))
}

/// Bounded exponential backoff for unary retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), doubling and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Client for a remote agent/checker endpoint over the secured transport.
pub struct SecureClient {
    addr: String,
    agent: AgentServiceClient<Channel>,
    health: HealthClient<Channel>,
    retry: RetryPolicy,
}

impl SecureClient {
    pub async fn connect(addr: &str, provider: &SecurityProvider) -> Result<Self> {
        let channel = connect_channel(addr, provider).await?;
        Ok(SecureClient {
            addr: addr.to_string(),
            agent: AgentServiceClient::new(channel.clone()),
            health: HealthClient::new(channel),
            retry: RetryPolicy::default(),
        })
    }

    pub async fn get_status(&self, request: StatusRequest) -> Result<StatusResponse> {
        self.retry_unary(|| {
            let mut client = self.agent.clone();
            // grpc-timeout rides along so the remote bounds its own work.
            let mut request = tonic::Request::new(request.clone());
            request.set_timeout(DEFAULT_RPC_TIMEOUT);
            async move {
                client
                    .get_status(request)
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(AgentError::from)
            }
        })
        .await
    }

    /// True when the remote health service reports SERVING for `service`
    /// (empty string queries overall server health).
    pub async fn check_health(&self, service: &str) -> Result<bool> {
        let response = self
            .retry_unary(|| {
                let mut client = self.health.clone();
                let mut request = tonic::Request::new(HealthCheckRequest {
                    service: service.to_string(),
                });
                request.set_timeout(DEFAULT_RPC_TIMEOUT);
                async move {
                    client
                        .check(request)
                        .await
                        .map(tonic::Response::into_inner)
                        .map_err(AgentError::from)
                }
            })
            .await?;
        Ok(response.status == PbServingStatus::Serving as i32)
    }

    async fn retry_unary<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(
                        "call to {} failed (attempt {}): {e}; retrying in {backoff:?}",
                        self.addr,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Caller deadlines
// ---------------------------------------------------------------------------

/// The remaining time a caller granted this request, read from the
/// standard `grpc-timeout` header (digits plus one of H/M/S/m/u/n).
/// Absent or malformed headers mean no caller deadline.
pub fn caller_timeout(metadata: &tonic::metadata::MetadataMap) -> Option<Duration> {
    let raw = metadata.get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 {
        return None;
    }
    let (value, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = value.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(value.saturating_mul(3600))),
        "M" => Some(Duration::from_secs(value.saturating_mul(60))),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Panic recovery
// ---------------------------------------------------------------------------

/// Run an RPC handler body, converting a panic into a generic internal
/// error instead of tearing down the connection task.
pub async fn recover<T>(
    fut: impl Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
) -> std::result::Result<tonic::Response<T>, tonic::Status> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("rpc handler panicked");
            Err(tonic::Status::internal("internal error"))
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Runs the agent's service (plus at most one health service) on a
/// keepalive-tuned tonic server.
pub struct GrpcServer {
    listen_addr: SocketAddr,
    health_registered: bool,
}

impl GrpcServer {
    pub fn new(listen_addr: SocketAddr) -> Self {
        GrpcServer {
            listen_addr,
            health_registered: false,
        }
    }

    /// Register the standard health service. Doing so twice is an error.
    pub fn register_health_service(&mut self) -> Result<()> {
        if self.health_registered {
            return Err(AgentError::Config(
                "health service already registered".to_string(),
            ));
        }
        self.health_registered = true;
        Ok(())
    }

    /// Serve until `cancel` fires, then stop gracefully; force-stop if the
    /// graceful stop has not completed within five seconds. Registered
    /// services are SERVING while up and NOT_SERVING once stopping.
    pub async fn serve<S>(
        self,
        svc: S,
        provider: &SecurityProvider,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: Service<
                http::Request<Body>,
                Response = http::Response<Body>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let mut builder = Server::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE_IDLE))
            .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
            .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT));
        if let Some(tls) = provider.server_tls()? {
            builder = builder
                .tls_config(tls)
                .map_err(|e| AgentError::Transport(format!("server tls: {e}")))?;
        }

        info!("grpc server listening on {}", self.listen_addr);
        let shutdown = cancel.clone();
        let signal = async move {
            shutdown.cancelled().await;
        };

        let (mut reporter, health_service) = tonic_health::server::health_reporter();
        let result = if self.health_registered {
            reporter.set_service_status("", ServingStatus::Serving).await;
            reporter.set_serving::<S>().await;
            let serve_fut = builder
                .add_service(svc)
                .add_service(health_service)
                .serve_with_shutdown(self.listen_addr, signal);
            run_with_force_stop(serve_fut, &cancel).await
        } else {
            let serve_fut = builder
                .add_service(svc)
                .serve_with_shutdown(self.listen_addr, signal);
            run_with_force_stop(serve_fut, &cancel).await
        };

        if self.health_registered {
            reporter
                .set_service_status("", ServingStatus::NotServing)
                .await;
            reporter.set_not_serving::<S>().await;
        }

        result
    }
}

async fn run_with_force_stop<F>(serve_fut: F, cancel: &CancellationToken) -> Result<()>
where
    F: Future<Output = std::result::Result<(), tonic::transport::Error>>,
{
    tokio::pin!(serve_fut);
    tokio::select! {
        result = &mut serve_fut => result.map_err(AgentError::from),
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(GRACEFUL_STOP).await;
        } => {
            warn!("graceful stop did not finish within {GRACEFUL_STOP:?}; forcing");
            Ok(())
        }
    }
}
