//! Real-time ADS-B telemetry pipeline.
//!
//! Raw Mode-S frames from a dump1090 feed are decoded and merged into
//! per-aircraft track state, republished as JSON snapshots over
//! WebSocket, and recorded as de-duplicated path history in SQLite by
//! a single-writer worker. Every mutable structure is owned by
//! exactly one task; components communicate over channels only.

pub mod agent;
pub mod assembler;
pub mod config;
pub mod decode;
pub mod feed;
pub mod geo;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod publish;
pub mod store;
pub mod subscribe;
pub mod supervisor;
