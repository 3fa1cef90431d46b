//! Generated gRPC bindings for `proto/monitoring.proto`.

pub mod monitoring {
    include!(concat!(env!("OUT_DIR"), "/monitoring.rs"));
}

pub use monitoring::agent_service_client::AgentServiceClient;
pub use monitoring::agent_service_server::{AgentService, AgentServiceServer};
pub use monitoring::{
    CaptureRequest, CaptureStats, PacketData, StatusRequest, StatusResponse, StopCaptureRequest,
};
