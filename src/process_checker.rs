//! Service-manager process liveness checker.
//!
//! Asks systemd whether the named unit is active. The unit name comes from
//! `details` (falling back to the service name) and must be a plain
//! `[A-Za-z0-9._-]` token of at most 256 chars so it can be handed to
//! `systemctl` as-is.

use crate::checker::{CheckResult, Checker};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const MAX_NAME_LEN: usize = 256;

pub struct ProcessChecker {
    process: String,
}

impl ProcessChecker {
    pub fn new(name: &str, details: &str) -> Result<Self> {
        let process = if details.is_empty() { name } else { details };
        validate_process_name(process)?;
        Ok(ProcessChecker {
            process: process.to_string(),
        })
    }

}

fn validate_process_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(AgentError::validation(format!(
            "invalid process name: {name:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl Checker for ProcessChecker {
    async fn check(&self) -> CheckResult {
        // kill_on_drop ties the child to the check's deadline: when the
        // dispatcher times the future out, the query dies with it.
        let output = Command::new("systemctl")
            .args(["is-active", &self.process])
            .kill_on_drop(true)
            .output()
            .await;

        let state = match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let state = stdout.trim();
                if state.is_empty() {
                    "unknown".to_string()
                } else {
                    state.to_string()
                }
            }
            Err(e) => {
                debug!("systemctl query for {} failed: {e}", self.process);
                "unknown".to_string()
            }
        };

        CheckResult {
            available: state == "active",
            message: format!("Process status: {state}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_fall_back_to_name() {
        let checker = ProcessChecker::new("sshd", "").unwrap();
        assert_eq!(checker.process, "sshd");
        let checker = ProcessChecker::new("ssh", "sshd.service").unwrap();
        assert_eq!(checker.process, "sshd.service");
    }

    #[test]
    fn test_name_length_boundaries() {
        let ok = "a".repeat(256);
        assert!(ProcessChecker::new("x", &ok).is_ok());
        let too_long = "a".repeat(257);
        assert!(ProcessChecker::new("x", &too_long).is_err());
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        for bad in ["", "a b", "a;b", "a/b", "$(boom)", "a\nb"] {
            assert!(ProcessChecker::new("", bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_allowed_charset() {
        assert!(ProcessChecker::new("x", "nginx").is_ok());
        assert!(ProcessChecker::new("x", "my-svc_2.service").is_ok());
    }
}
