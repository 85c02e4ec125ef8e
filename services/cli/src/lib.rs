//! Relay CLI Library Crate
//!
//! The interactive client for the relay server. `client` owns the connection
//! and the conversation; the `relay-cli` binary wraps it in a REPL.

pub mod client;
