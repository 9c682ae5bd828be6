pub mod config;
pub mod drain;
pub mod error;
pub mod frame;
pub mod signal;
pub mod telemetry;
pub mod tls;

pub mod proto {
	tonic::include_proto!("silo.tunnel.v1");
}

pub use error::Error;
pub use frame::{Frame, FrameKind};
