//! Alarm notification delivery.
//!
//! This crate provides:
//! - `Notifier` trait for pluggable notification channels
//! - Telegram notifier implementation
//! - Minijinja template rendering for opened/cleared alarm messages
//! - Dispatcher that delivers each intent to the admin and, when distinct, the owner

pub mod dispatcher;
pub mod telegram;
pub mod templating;
pub mod traits;

pub use dispatcher::{Dispatcher, NotificationSummary};
pub use telegram::{ParseMode, TelegramNotifier};
pub use traits::{Notification, Notifier, NotifyError};
