//! AuraBridge - multimodal data acquisition service
//!
//! The binary wires [`config::AppConfig`] and [`logging`] around the
//! acquisition controller and the WebSocket gateway.

pub mod config;
pub mod logging;

pub use config::AppConfig;
