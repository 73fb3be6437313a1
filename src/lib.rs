//! Telemetry Gateway - real-time sensor ingestion over WebSocket
//!
//! This library implements a telemetry ingestion service for fleets of
//! field devices. It handles:
//!
//! - A WebSocket gateway speaking a JSON message protocol
//! - Recording sessions with an at-most-one-active-per-device guarantee
//! - An in-memory ingestion buffer with threshold and timer flushes
//! - Transactional batch persistence with per-row failure isolation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_gateway::{
//!     Config, Gateway, IngestBuffer, ReadingSink, SessionRegistry, TelemetryStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!
//!     let store = Arc::new(TelemetryStore::new(&config.database).await?);
//!     store.run_migrations().await?;
//!
//!     let registry = Arc::new(SessionRegistry::new(store.clone()));
//!     let buffer = Arc::new(IngestBuffer::new(
//!         config.buffer.clone(),
//!         store.clone() as Arc<dyn ReadingSink>,
//!     ));
//!     let _gateway = Gateway::new(config.gateway.clone(), registry, buffer);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod buffer;
pub mod config;
pub mod gateway;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod store;

// Re-export main types
pub use api::{create_router, start_api_server, AppState};
pub use buffer::{
    BatchInsertResult, BufferStats, BufferedReading, IngestBuffer, ReadingSink, SinkError,
};
pub use config::{BufferConfig, Config, DatabaseConfig, GatewayConfig, ServiceConfig};
pub use gateway::{ConnectedDevice, ConnectionIdentity, Gateway, GatewayStats, Outbound};
pub use model::{Reading, SensorType, Session, SessionStatus, ValidationError};
pub use protocol::{close_code, ClientMessage, ErrorCode, ServerMessage};
pub use registry::SessionRegistry;
pub use store::{BatchOutcome, StoreError, StoredReading, TelemetryStore};
