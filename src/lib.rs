//! Host activity monitoring agent: per-thread I/O and transaction analysis,
//! per-program aggregation, and a prioritized outbound message pipeline.

pub mod agent;
pub mod analyzer;
pub mod config;
pub mod export;
pub mod ingest;
pub mod protocol;
pub mod session;
pub mod telemetry;
