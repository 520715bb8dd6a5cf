//! Durable state of the alarm engine.
//!
//! This crate provides:
//! - `StateStore`: the Counter Store + Alarm Registry contract used once per cycle
//! - `AlarmOperations`: operator actions outside the per-cycle scan
//! - `TelemetrySource`: per-cycle snapshots, entity configuration and grace status
//! - In-memory and PostgreSQL implementations

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StorageError;
pub use memory::InMemoryStore;
pub use postgres::{PgStateStore, PgTelemetrySource};
pub use traits::{AlarmOperations, CycleInput, StateStore, TelemetrySource};
