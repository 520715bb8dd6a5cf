use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| v.is_finite())
        .unwrap_or(default)
}

fn profiled_env_duration(profile: &str, key: &str, default: Duration) -> Duration {
    match profiled_env_opt(profile, key) {
        Some(raw) => parse_duration(&raw).unwrap_or_else(|| {
            tracing::warn!(key, value = %raw, "unparseable duration, using default");
            default
        }),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub monitor: MonitorConfig,
    pub detection: DetectionConfig,
    pub telegram: TelegramConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &["PG_HOST", "TELEGRAM_BOT_TOKEN", "MONITOR_CRON"];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PVWATCH_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PVWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            monitor: MonitorConfig::from_env_profiled(p),
            detection: DetectionConfig::from_env_profiled(p),
            telegram: TelegramConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!(
            "  monitor:     cron={}, timeout={}s, grace={}s",
            self.monitor.cycle_cron,
            self.monitor.cycle_timeout.as_secs(),
            self.monitor.recovery_grace.as_secs()
        );
        tracing::info!(
            "  detection:   string_down_floor={}, partial_floor={}",
            self.detection.string_down_floor,
            self.detection.partial_floor
        );
        tracing::info!(
            "  telegram:    configured={}, admin_chat={}",
            self.telegram.is_configured(),
            self.telegram.admin_chat_id.as_deref().unwrap_or("(none)")
        );
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
            "monitor": {
                "cycle_cron": self.monitor.cycle_cron,
                "cycle_timeout_secs": self.monitor.cycle_timeout.as_secs(),
                "recovery_grace_secs": self.monitor.recovery_grace.as_secs(),
            },
            "detection": self.detection,
            "telegram": {
                "configured": self.telegram.is_configured(),
                "admin_chat_id": self.telegram.admin_chat_id,
            },
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "pvwatch"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 5),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Monitoring cycle ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 5-field cron expression for cycle ticks.
    pub cycle_cron: String,
    /// Wall-clock budget of one cycle; an overrun fails the cycle.
    pub cycle_timeout: Duration,
    /// Offline suppression window after a vendor API recovers.
    pub recovery_grace: Duration,
}

impl MonitorConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            cycle_cron: profiled_env_or(p, "MONITOR_CRON", "*/5 * * * *"),
            cycle_timeout: profiled_env_duration(p, "CYCLE_TIMEOUT", Duration::from_secs(240)),
            recovery_grace: profiled_env_duration(
                p,
                "RECOVERY_GRACE",
                Duration::from_secs(crate::grace::DEFAULT_RECOVERY_GRACE_MINUTES as u64 * 60),
            ),
        }
    }
}

// ── Detection thresholds ──────────────────────────────────────

/// Floors, bands and confirmation counts of the detection rules.
///
/// Bands are fractions of the inverter's peak channel current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// STRING_DOWN is evaluated only while the peak is strictly above this.
    pub string_down_floor: f64,
    /// A channel at or below this current counts as down.
    pub string_down_max_current: f64,
    pub string_down_confirm: u32,
    /// MPPT and half-string rules are evaluated only while the peak is at least this.
    pub partial_floor: f64,
    pub partial_confirm: u32,
    pub mppt_two_down_band: (f64, f64),
    pub mppt_one_down_band: (f64, f64),
    pub half_string_band: (f64, f64),
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            string_down_floor: 8.0,
            string_down_max_current: 0.5,
            string_down_confirm: 2,
            partial_floor: 13.0,
            partial_confirm: 4,
            mppt_two_down_band: (0.15, 0.45),
            mppt_one_down_band: (0.50, 0.80),
            half_string_band: (0.30, 0.70),
        }
    }
}

impl DetectionConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            string_down_floor: profiled_env_f64(p, "STRING_DOWN_FLOOR", d.string_down_floor),
            string_down_max_current: profiled_env_f64(
                p,
                "STRING_DOWN_MAX_CURRENT",
                d.string_down_max_current,
            ),
            string_down_confirm: profiled_env_u32(p, "STRING_DOWN_CONFIRM", d.string_down_confirm).max(1),
            partial_floor: profiled_env_f64(p, "PARTIAL_FLOOR", d.partial_floor),
            partial_confirm: profiled_env_u32(p, "PARTIAL_CONFIRM", d.partial_confirm).max(1),
            ..d
        }
    }
}

// ── Telegram ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token, or `${VAR}` naming the env var that holds it.
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    pub admin_chat_id: Option<String>,
    pub parse_mode: Option<String>,
}

impl TelegramConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            bot_token: profiled_env_opt(p, "TELEGRAM_BOT_TOKEN"),
            admin_chat_id: profiled_env_opt(p, "TELEGRAM_ADMIN_CHAT_ID"),
            parse_mode: profiled_env_opt(p, "TELEGRAM_PARSE_MODE"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_defaults_match_rule_constants() {
        let d = DetectionConfig::default();
        assert_eq!(d.string_down_floor, 8.0);
        assert_eq!(d.string_down_max_current, 0.5);
        assert_eq!(d.string_down_confirm, 2);
        assert_eq!(d.partial_floor, 13.0);
        assert_eq!(d.partial_confirm, 4);
        assert_eq!(d.mppt_two_down_band, (0.15, 0.45));
        assert_eq!(d.mppt_one_down_band, (0.50, 0.80));
        assert_eq!(d.half_string_band, (0.30, 0.70));
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        env::set_var("PVTEST_PG_HOST", "db.internal");
        env::set_var("PVTEST_CYCLE_TIMEOUT", "3m");
        let cfg = Config::for_profile("pvtest");
        assert_eq!(cfg.profile_label(), "PVTEST");
        assert_eq!(cfg.postgres.host, "db.internal");
        assert_eq!(cfg.monitor.cycle_timeout, Duration::from_secs(180));
        env::remove_var("PVTEST_PG_HOST");
        env::remove_var("PVTEST_CYCLE_TIMEOUT");
    }

    #[test]
    fn redacted_summary_hides_bot_token() {
        let mut cfg = Config::for_profile("REDACTTEST");
        cfg.telegram.bot_token = Some("123:SECRET".to_string());
        let summary = cfg.redacted_summary().to_string();
        assert!(!summary.contains("SECRET"));
    }
}
