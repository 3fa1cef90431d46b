pub mod combined;
pub mod duration;
pub mod error;
pub mod icmp;
pub mod sweep;
pub mod target;
pub mod tcp;

pub use combined::CombinedScanner;
pub use duration::Duration;
pub use error::SweepError;
pub use icmp::IcmpSweeper;
pub use sweep::{SweepConfig, SweepService, SweepSummary};
pub use target::{
    compare_ip_strings, expand_cidr, generate_targets, sort_hosts, SweepMode, SweepResult, Target,
};
pub use tcp::TcpScanner;
