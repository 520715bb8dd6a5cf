//! alarm-worker: runs monitoring cycles on a cron schedule.
//!
//! Each due tick reads the latest snapshots, entity configuration and vendor
//! grace windows from PostgreSQL and runs one lifecycle cycle. The configured
//! wall-clock budget bounds loading and evaluation; a commit that has started
//! always finishes. The resulting notifications go out in the background.
//!
//! Subcommands expose the operator actions that live outside the cycle:
//! vendor events, manual closure, annotations and history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use pvwatch_core::config::{load_dotenv, Config};
use pvwatch_core::{EntityId, Severity};
use pvwatch_notify::{Dispatcher, NotificationSummary, TelegramNotifier};
use pvwatch_rules::scheduler::CycleScheduler;
use pvwatch_rules::{DetectionEngine, LifecycleCoordinator};
use pvwatch_storage::{AlarmOperations, PgStateStore, PgTelemetrySource, TelemetrySource};

// ── CLI ─────────────────────────────────────────────────────────────

/// Solar inverter alarm worker.
#[derive(Parser, Debug)]
#[command(name = "alarm-worker", version, about)]
struct Cli {
    /// Run a single cycle, wait for its notifications, and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between scheduler polls.
    #[arg(long, env = "MONITOR_TICK_SECS", default_value_t = 15)]
    tick_secs: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration without secrets.
    Config,

    /// Record a vendor API health probe and update its recovery grace window.
    VendorHealth {
        vendor: String,
        #[arg(long, action = ArgAction::Set)]
        healthy: bool,
    },

    /// Open an EXTERNAL_VENDOR_EVENT alarm.
    OpenEvent {
        plant: String,
        inverter: String,
        #[arg(long)]
        detail: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "medium")]
        severity: Severity,
    },

    /// Close an open alarm by id.
    CloseAlarm {
        id: Uuid,
        #[arg(long)]
        observation: Option<String>,
    },

    /// Set the observation note on an open alarm.
    Annotate { id: Uuid, observation: String },

    /// List open and closed alarms of one inverter.
    History { plant: String, inverter: String },

    /// Send a test message through the Telegram channel.
    TestNotify {
        /// Chat id; defaults to the admin chat.
        chat_id: Option<String>,
    },
}

// ── Wiring ──────────────────────────────────────────────────────────

fn build_dispatcher(config: &Config) -> Dispatcher {
    let mut dispatcher = Dispatcher::empty();
    if !config.telegram.is_configured() {
        warn!("Telegram is not configured, alarm notifications will not be delivered");
        return dispatcher;
    }
    match TelegramNotifier::from_config(&config.telegram) {
        Ok(notifier) => dispatcher.add_channel(Box::new(notifier)),
        Err(e) => warn!(error = %e, "Telegram notifier disabled"),
    }
    dispatcher
}

struct Worker {
    coordinator: Arc<LifecycleCoordinator>,
    telemetry: PgTelemetrySource,
    dispatcher: Arc<Dispatcher>,
    budget: Duration,
}

impl Worker {
    /// Run one cycle and spawn its notification dispatch.
    async fn cycle(&self) -> anyhow::Result<JoinHandle<NotificationSummary>> {
        let input = self.telemetry.cycle_input(Utc::now()).await?;
        let outcome = self.coordinator.run_cycle_within(&input, self.budget).await?;

        let report = &outcome.report;
        info!(
            evaluated = report.entities_evaluated,
            skipped = report.entities_skipped,
            channels_skipped = report.channels_skipped,
            opened = report.alarms_opened,
            cleared = report.alarms_cleared,
            counters_written = report.counters_written,
            counters_deleted = report.counters_deleted,
            duration_ms = report.duration_ms,
            "cycle committed"
        );

        let coordinator = self.coordinator.clone();
        let dispatcher = self.dispatcher.clone();
        Ok(tokio::spawn(async move {
            coordinator.notify(&outcome, &dispatcher).await
        }))
    }

    async fn run(&self, mut scheduler: CycleScheduler, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if !scheduler.is_due(now) {
                        continue;
                    }
                    scheduler.record_run(now);
                    if let Err(e) = self.cycle().await {
                        error!(error = %e, "cycle failed before its commit, state unchanged");
                    }
                    if let Some(next) = scheduler.next_after(now) {
                        info!(next = %next, "next cycle scheduled");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();

    if let Some(Command::Config) = cli.command {
        println!("{}", serde_json::to_string_pretty(&config.redacted_summary())?);
        println!("available profiles: {}", Config::available_profiles().join(", "));
        return Ok(());
    }
    if let Some(Command::TestNotify { chat_id }) = &cli.command {
        let dispatcher = build_dispatcher(&config);
        let target = chat_id
            .clone()
            .or_else(|| config.telegram.admin_chat_id.clone())
            .ok_or_else(|| anyhow::anyhow!("no chat id given and TELEGRAM_ADMIN_CHAT_ID is unset"))?;
        dispatcher.test_notify(0, &target).await?;
        info!(chat_id = %target, "test notification sent");
        return Ok(());
    }

    config.log_summary();
    let store = Arc::new(PgStateStore::connect(&config.postgres).await?);

    match cli.command {
        Some(Command::VendorHealth { vendor, healthy }) => {
            let telemetry = PgTelemetrySource::new(store.pool().clone());
            let grace = chrono::Duration::from_std(config.monitor.recovery_grace)?;
            let status = telemetry.record_vendor_health(&vendor, healthy, Utc::now(), grace).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(Command::OpenEvent { plant, inverter, detail, message, severity }) => {
            let alarm = store
                .open_external_event(EntityId::new(plant, inverter), severity, &detail, &message, Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&alarm)?);
        }
        Some(Command::CloseAlarm { id, observation }) => {
            let alarm = store.close_alarm(id, Utc::now(), observation.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&alarm)?);
        }
        Some(Command::Annotate { id, observation }) => {
            let alarm = store.annotate_alarm(id, &observation).await?;
            println!("{}", serde_json::to_string_pretty(&alarm)?);
        }
        Some(Command::History { plant, inverter }) => {
            let alarms = store.alarm_history(&EntityId::new(plant, inverter)).await?;
            println!("{}", serde_json::to_string_pretty(&alarms)?);
        }
        Some(Command::Config) | Some(Command::TestNotify { .. }) => {}
        None => {
            let admin_target = config.telegram.admin_chat_id.as_deref();
            if admin_target.is_none() {
                warn!("TELEGRAM_ADMIN_CHAT_ID is unset, only inverter owners will be notified");
            }
            let worker = Worker {
                coordinator: Arc::new(LifecycleCoordinator::new(
                    store.clone(),
                    DetectionEngine::new(config.detection.clone()),
                    admin_target,
                )),
                telemetry: PgTelemetrySource::new(store.pool().clone()),
                dispatcher: Arc::new(build_dispatcher(&config)),
                budget: config.monitor.cycle_timeout,
            };

            if cli.once {
                let summary = worker.cycle().await?.await?;
                info!(
                    delivered = summary.delivered,
                    failed = summary.failed,
                    rate_limited = summary.rate_limited,
                    "notifications dispatched"
                );
                return Ok(());
            }

            let scheduler = CycleScheduler::new(&config.monitor.cycle_cron)?;
            info!(cron = %scheduler.cron_expression(), "alarm-worker starting");
            worker.run(scheduler, Duration::from_secs(cli.tick_secs.max(1))).await;
            info!("alarm-worker exited cleanly");
        }
    }
    Ok(())
}
