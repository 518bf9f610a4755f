//! AuraBridge Gateway - WebSocket control channel for the acquisition service

pub mod rpc;
pub mod server;
pub mod ws;

pub use server::{router, serve, start_gateway, GatewayState};
