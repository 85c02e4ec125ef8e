//! Relay Server Library Crate
//!
//! This library contains the WebSocket relay service: configuration, shared
//! state, the TLS listener, the per-connection protocol and routing. The
//! `relay-server` binary is a thin wrapper around this library.

pub mod config;
pub mod router;
pub mod state;
pub mod tls;
pub mod ws;
