//! Cron scheduling of monitoring cycles.
//!
//! The worker polls [`CycleScheduler::is_due`] from its tick loop and records
//! each cycle it starts. Expressions use standard 5-field cron and are
//! normalized for the `cron` crate, which expects a seconds field.

mod core;
pub(crate) mod cron;


pub use self::core::CycleScheduler;
