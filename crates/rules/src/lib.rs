//! Alarm detection and lifecycle reconciliation for solar inverter fleets.
//!
//! This crate provides:
//! - Per-cycle counter and open-alarm indexes passed explicitly through evaluation
//! - Detection rules (string down, MPPT partial faults, half string, offline)
//!   with activity floors, banded thresholds and consecutive-cycle confirmation
//! - The lifecycle coordinator: load, evaluate, reconcile, persist, notify
//! - Cron-driven cycle scheduling for the `alarm-worker` binary

pub mod detection;
pub mod lifecycle;
pub mod scheduler;
pub mod state;

pub use detection::DetectionEngine;
pub use lifecycle::{CycleError, CycleOutcome, CycleReport, LifecycleCoordinator};
