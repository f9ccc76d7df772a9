//! # msgrelay-client
//!
//! Client library for msgrelay.
//!
//! This crate provides:
//! - One-shot request/response exchanges over TCP with timeouts
//! - High-level API for the five relay operations
//! - Error mapping for general error responses

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
