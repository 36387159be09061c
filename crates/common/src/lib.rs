//! Common utilities, types, and configuration shared across Sluice crates.
//!
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Models**: Data source definitions (`models`).
//! - **Resilience**: Exponential backoff helper (`retry`).
//! - **Telemetry**: Tracing and OTLP setup (`telemetry`).
//! - **Logging**: Literal scrubbing for logged SQL (`scrubber`).
pub mod config;
pub mod models;
pub mod retry;
pub mod scrubber;
pub mod telemetry;
pub use crate::models::{Dialect, SourceConfig};
