//! Agent configuration and on-disk checker config discovery.
//!
//! The agent reads one `agent.json` (listen address, security, config
//! directory) plus a directory of per-checker JSON documents. Files whose
//! basename starts with `snmp` are SNMP-typed and keep their raw body in
//! `additional`; everything else is decoded as a [`CheckerConfig`].

use crate::error::{AgentError, Result};
use crate::security::SecurityConfig;
use net_sweep::duration::Duration as JsonDuration;
use net_sweep::SweepConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_CHECKERS_DIR: &str = "/etc/serviceradar/checkers";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// host:port the agent's gRPC endpoint binds.
    pub listen_addr: String,
    #[serde(default = "default_checkers_dir")]
    pub checkers_dir: PathBuf,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Where the SNMP checker reads its own config; defaults to
    /// `<checkers_dir>/snmp.json`.
    #[serde(default)]
    pub snmp_config_path: Option<PathBuf>,
}

fn default_checkers_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKERS_DIR)
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn snmp_config_path(&self) -> PathBuf {
        self.snmp_config_path
            .clone()
            .unwrap_or_else(|| self.checkers_dir.join("snmp.json"))
    }

    pub fn sweep_config_path(&self) -> PathBuf {
        self.checkers_dir.join("sweep").join("sweep.json")
    }

    /// Example document for `serviceradar-agent init`.
    pub fn example() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:50051".to_string(),
            checkers_dir: default_checkers_dir(),
            security: SecurityConfig::default(),
            snmp_config_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checker configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub checker_type: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_checker_timeout")]
    pub timeout: JsonDuration,
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Opaque checker-specific payload; raw file body for SNMP configs.
    #[serde(default)]
    pub additional: serde_json::Value,
}

fn default_checker_timeout() -> JsonDuration {
    JsonDuration::from_secs(30)
}

impl CheckerConfig {
    /// Dial target for remote checkers: `address`, joined with `port` when
    /// the address carries none.
    pub fn endpoint(&self) -> Option<String> {
        self.address.as_ref().map(|addr| match self.port {
            Some(port) if !addr.contains(':') => format!("{addr}:{port}"),
            _ => addr.clone(),
        })
    }
}

/// Enumerate `*.json` under `dir` into named checker configs.
///
/// A missing directory is an empty set; an unreadable or malformed file is
/// fatal, configuration problems should surface at startup.
pub fn discover_checker_configs(
    dir: &Path,
    agent_listen_addr: &str,
) -> Result<HashMap<String, CheckerConfig>> {
    let mut configs = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("no checker config directory at {}", dir.display());
            return Ok(configs);
        }
        Err(e) => {
            return Err(AgentError::Config(format!(
                "read checker config dir {}: {e}",
                dir.display()
            )))
        }
    };

    for entry in entries {
        let path = entry
            .map_err(|e| AgentError::Config(format!("scan {}: {e}", dir.display())))?
            .path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };

        let text = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;

        // snmp* files are SNMP-typed with the whole body as their payload.
        if stem.starts_with("snmp") {
            configs.insert(
                stem.clone(),
                CheckerConfig {
                    name: stem,
                    checker_type: "snmp".to_string(),
                    address: None,
                    port: None,
                    timeout: default_checker_timeout(),
                    listen_addr: None,
                    additional: serde_json::Value::String(text),
                },
            );
            continue;
        }

        let mut config: CheckerConfig = serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;
        if config.checker_type == "grpc" && config.address.as_deref().unwrap_or("").is_empty() {
            config.address = Some(
                config
                    .listen_addr
                    .clone()
                    .unwrap_or_else(|| agent_listen_addr.to_string()),
            );
        }
        configs.insert(config.name.clone(), config);
    }

    Ok(configs)
}

/// Load `sweep/sweep.json` if present.
pub fn load_sweep_config(path: &Path) -> Result<Option<SweepConfig>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AgentError::Config(format!(
                "read {}: {e}",
                path.display()
            )))
        }
    };
    let config: SweepConfig = serde_json::from_str(&text)
        .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;
    Ok(Some(config))
}
