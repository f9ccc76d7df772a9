//! # msgrelay-server
//!
//! TCP server for msgrelay.
//!
//! This crate provides:
//! - Task-per-connection serving with a bounded number of active connections
//! - Request reading with timed continuation reads for message content
//! - A static request code dispatch table and the five request handlers
//! - At-least-once delivery of pending messages
//! - Configuration loading and Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, StorageConfig};
pub use connection::{ConnectionLimits, IncomingRequest};
pub use error::{HandlerError, ServerError};
pub use handler::{DeliveryAck, Reply, RequestHandler};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
