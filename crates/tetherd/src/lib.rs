//! tetherd library.
//!
//! Supervises one local agent process, speaks its newline-delimited JSON
//! protocol over stdio, and exposes it to paired clients over HTTP and
//! WebSocket.

pub mod agent;
pub mod api;
pub mod config;
pub mod pairing;
pub mod ws;
