//! Error type for the sweep data plane.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    /// Malformed CIDR, port, or target specification.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Raw or stream socket could not be opened or used.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}
