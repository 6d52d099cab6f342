//! Tempdrop: a temporary file drop
//!
//! Uploaded files live for a fixed time and are then deleted. Every
//! connected client sees the live set change in real time over a WebSocket.

pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod server;
pub mod types;
pub mod ws;

#[cfg(test)]
mod testing;
