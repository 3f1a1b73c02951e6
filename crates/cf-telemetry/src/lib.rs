//! Telemetry infrastructure for CodeFRAME services.
//!
//! Structured logging setup (human-readable and JSON variants) via the
//! `tracing` ecosystem, plus request-correlation middleware for the HTTP
//! surface.

pub mod logging;
pub mod middleware;
