//! Role-scoped transport security.
//!
//! A [`SecurityProvider`] loads the credential sets its role is entitled to
//! and hands out ready-made tonic TLS configs. mTLS expects the standard
//! cert directory layout (`root.pem`, `server.pem`/`server-key.pem`,
//! `client.pem`/`client-key.pem`); the server side always requires and
//! verifies a client certificate against the CA pool. The provider is
//! immutable after construction and safe to share across tasks.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

const DEFAULT_CERT_DIR: &str = "/etc/serviceradar/certs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    None,
    Mtls,
    Spiffe,
}

/// A peer's role decides which credential sets get loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityRole {
    Poller,
    #[default]
    Agent,
    Core,
    Checker,
}

impl SecurityRole {
    /// Poller and agent dial out; core and checker only serve.
    fn loads_client(self) -> bool {
        matches!(self, SecurityRole::Poller | SecurityRole::Agent)
    }

    fn loads_server(self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub mode: SecurityMode,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub role: SecurityRole,
    #[serde(default)]
    pub trust_domain: Option<String>,
    #[serde(default)]
    pub workload_socket: Option<PathBuf>,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_DIR)
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            mode: SecurityMode::default(),
            cert_dir: default_cert_dir(),
            server_name: None,
            role: SecurityRole::default(),
            trust_domain: None,
            workload_socket: None,
        }
    }
}

/// Immutable holder of the TLS material for this process's role.
pub struct SecurityProvider {
    client_enabled: bool,
    server_enabled: bool,
    client: Option<ClientTlsConfig>,
    server: Option<ServerTlsConfig>,
}

impl SecurityProvider {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let client_enabled = config.role.loads_client();
        let server_enabled = config.role.loads_server();

        match config.mode {
            SecurityMode::None => Ok(SecurityProvider {
                client_enabled,
                server_enabled,
                client: None,
                server: None,
            }),
            SecurityMode::Spiffe => Err(AgentError::Config(
                "spiffe security mode is not supported by this build; use mtls or none"
                    .to_string(),
            )),
            SecurityMode::Mtls => {
                let ca = read_pem(&config.cert_dir, "root.pem")?;

                let client = if client_enabled {
                    let cert = read_pem(&config.cert_dir, "client.pem")?;
                    let key = read_pem(&config.cert_dir, "client-key.pem")?;
                    let mut tls = ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(&ca))
                        .identity(Identity::from_pem(&cert, &key));
                    if let Some(name) = &config.server_name {
                        tls = tls.domain_name(name);
                    }
                    Some(tls)
                } else {
                    None
                };

                let server = if server_enabled {
                    let cert = read_pem(&config.cert_dir, "server.pem")?;
                    let key = read_pem(&config.cert_dir, "server-key.pem")?;
                    Some(
                        ServerTlsConfig::new()
                            .identity(Identity::from_pem(&cert, &key))
                            .client_ca_root(Certificate::from_pem(&ca))
                            .client_auth_optional(false),
                    )
                } else {
                    None
                };

                Ok(SecurityProvider {
                    client_enabled,
                    server_enabled,
                    client,
                    server,
                })
            }
        }
    }

    /// TLS config for dialing out; `None` means plaintext (mode none).
    pub fn client_tls(&self) -> Result<Option<ClientTlsConfig>> {
        if !self.client_enabled {
            return Err(AgentError::Config("not configured as client".to_string()));
        }
        Ok(self.client.clone())
    }

    /// TLS config for serving; `None` means plaintext (mode none).
    pub fn server_tls(&self) -> Result<Option<ServerTlsConfig>> {
        if !self.server_enabled {
            return Err(AgentError::Config("not configured as server".to_string()));
        }
        Ok(self.server.clone())
    }
}

fn read_pem(dir: &Path, file: &str) -> Result<Vec<u8>> {
    let path = dir.join(file);
    std::fs::read(&path)
        .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))
}
