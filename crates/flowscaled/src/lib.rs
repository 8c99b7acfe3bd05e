//! Flowscale daemon internals: configuration and subsystem wiring.

pub mod config;
pub mod standalone;

pub use config::FlowscaleConfig;
pub use standalone::ControlPlane;
