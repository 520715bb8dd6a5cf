pub mod alarm;
pub mod config;
pub mod duration;
pub mod error;
pub mod grace;
pub mod telemetry;

pub use alarm::*;
pub use config::{Config, DetectionConfig, MonitorConfig, PostgresConfig, TelegramConfig};
pub use error::*;
pub use grace::*;
pub use telemetry::*;
