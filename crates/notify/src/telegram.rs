//! Telegram delivery for alarm notifications.
//!
//! One `sendMessage` call per recipient chat. The rendered subject goes out as
//! a bold first line above the body, escaped for the configured parse mode so
//! unit names like `MPPT 2 (strings 4, 5, 6)` survive MarkdownV2.

use serde::Deserialize;

use pvwatch_core::TelegramConfig;

use crate::traits::{Notification, Notifier, NotifyError};

const API_BASE: &str = "https://api.telegram.org";

/// Wait applied when a 429 carries no `retry_after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// How Telegram should interpret message text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseMode {
    #[default]
    Plain,
    MarkdownV2,
    Html,
}

impl ParseMode {
    /// Read `TELEGRAM_PARSE_MODE`. Unset or blank means plain text.
    pub fn from_config(value: Option<&str>) -> Result<Self, NotifyError> {
        match value.map(str::trim) {
            None | Some("") => Ok(ParseMode::Plain),
            Some(v) if v.eq_ignore_ascii_case("markdownv2") => Ok(ParseMode::MarkdownV2),
            Some(v) if v.eq_ignore_ascii_case("html") => Ok(ParseMode::Html),
            Some(other) => Err(NotifyError::Config(format!(
                "unsupported Telegram parse mode '{other}' (expected MarkdownV2 or HTML)"
            ))),
        }
    }

    fn api_value(self) -> Option<&'static str> {
        match self {
            ParseMode::Plain => None,
            ParseMode::MarkdownV2 => Some("MarkdownV2"),
            ParseMode::Html => Some("HTML"),
        }
    }

    /// Escape literal text so it renders verbatim in this mode.
    pub fn escape(self, text: &str) -> String {
        match self {
            ParseMode::Plain => text.to_string(),
            ParseMode::MarkdownV2 => escape_markdown_v2(text),
            ParseMode::Html => escape_html(text),
        }
    }

    fn bold(self, text: &str) -> String {
        match self {
            ParseMode::Plain => text.to_string(),
            ParseMode::MarkdownV2 => format!("*{}*", escape_markdown_v2(text)),
            ParseMode::Html => format!("<b>{}</b>", escape_html(text)),
        }
    }
}

/// Backslash-escape every character MarkdownV2 reserves, the backslash
/// included.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for ch in text.chars() {
        if matches!(
            ch,
            '\\' | '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '='
                | '|' | '{' | '}' | '.' | '!'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Message text as sent: bold subject line, blank line, body.
pub fn format_message(mode: ParseMode, notification: &Notification) -> String {
    if notification.subject.is_empty() {
        return mode.escape(&notification.body);
    }
    format!("{}\n\n{}", mode.bold(&notification.subject), mode.escape(&notification.body))
}

/// Resolve a `${VAR}` token reference; literal tokens pass through.
fn resolve_token(raw: &str) -> Result<String, NotifyError> {
    let token = match raw.strip_prefix("${") {
        Some(rest) => {
            let var = rest.strip_suffix('}').ok_or_else(|| {
                NotifyError::Config(format!("malformed bot token reference '{raw}'"))
            })?;
            std::env::var(var).map_err(|_| {
                NotifyError::Config(format!("bot token variable '{var}' is not set"))
            })?
        }
        None => raw.to_string(),
    };
    if token.trim().is_empty() {
        return Err(NotifyError::Config("Telegram bot token is empty".to_string()));
    }
    Ok(token)
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

fn check_response(status: reqwest::StatusCode, response: ApiResponse) -> Result<(), NotifyError> {
    if response.ok {
        return Ok(());
    }
    let retry_after = response.parameters.and_then(|p| p.retry_after);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || retry_after.is_some() {
        return Err(NotifyError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        });
    }
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        description: response
            .description
            .unwrap_or_else(|| "no description".to_string()),
    })
}

/// Sends alarm notifications to Telegram chats.
#[derive(Debug)]
pub struct TelegramNotifier {
    bot_token: String,
    parse_mode: ParseMode,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, parse_mode: ParseMode) -> Result<Self, NotifyError> {
        Ok(Self {
            bot_token: resolve_token(bot_token)?,
            parse_mode,
            client: reqwest::Client::new(),
        })
    }

    pub fn from_config(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let token = config
            .bot_token
            .as_deref()
            .ok_or_else(|| NotifyError::Config("TELEGRAM_BOT_TOKEN is not set".to_string()))?;
        Self::new(token, ParseMode::from_config(config.parse_mode.as_deref())?)
    }

    pub fn parse_mode(&self) -> ParseMode {
        self.parse_mode
    }

    fn payload(&self, chat_id: &str, notification: &Notification) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": format_message(self.parse_mode, notification),
            "disable_web_page_preview": true,
        });
        if let Some(mode) = self.parse_mode.api_value() {
            payload["parse_mode"] = mode.into();
        }
        payload
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError> {
        let url = format!("{API_BASE}/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&self.payload(recipient, notification))
            .send()
            .await?;

        let status = response.status();
        check_response(status, response.json::<ApiResponse>().await?)?;
        tracing::debug!(chat_id = %recipient, "Telegram message accepted");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::collections::HashMap;

    fn notification(subject: &str, body: &str) -> Notification {
        Notification {
            subject: subject.to_string(),
            body: body.to_string(),
            metadata: HashMap::new(),
        }
    }

    fn response(json: serde_json::Value) -> ApiResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parse_mode_reads_config_values() {
        assert_eq!(ParseMode::from_config(None).unwrap(), ParseMode::Plain);
        assert_eq!(ParseMode::from_config(Some(" ")).unwrap(), ParseMode::Plain);
        assert_eq!(ParseMode::from_config(Some("MarkdownV2")).unwrap(), ParseMode::MarkdownV2);
        assert_eq!(ParseMode::from_config(Some("html")).unwrap(), ParseMode::Html);
        assert!(ParseMode::from_config(Some("Markdown")).is_err());
    }

    #[test]
    fn mppt_unit_names_survive_markdown() {
        let text = "MPPT 2 (strings 4, 5, 6) at 8.00 A (40% of peak 20.00 A): two strings likely down";
        assert_eq!(
            escape_markdown_v2(text),
            r"MPPT 2 \(strings 4, 5, 6\) at 8\.00 A \(40% of peak 20\.00 A\): two strings likely down"
        );
        assert_eq!(escape_markdown_v2(r"a\b"), r"a\\b");
    }

    #[test]
    fn subject_is_bold_per_mode() {
        let n = notification("INV-7 down", "String 2 at 0.20 A");
        assert_eq!(
            format_message(ParseMode::MarkdownV2, &n),
            "*INV\\-7 down*\n\nString 2 at 0\\.20 A"
        );
        assert_eq!(
            format_message(ParseMode::Html, &notification("a < b", "x & y")),
            "<b>a &lt; b</b>\n\nx &amp; y"
        );
        assert_eq!(format_message(ParseMode::Plain, &n), "INV-7 down\n\nString 2 at 0.20 A");
        assert_eq!(format_message(ParseMode::Plain, &notification("", "only body")), "only body");
    }

    #[test]
    fn payload_targets_recipient_chat() {
        let html = TelegramNotifier::new("123:abc", ParseMode::Html).unwrap();
        let payload = html.payload("-100200", &notification("s", "b"));
        assert_eq!(payload["chat_id"], "-100200");
        assert_eq!(payload["parse_mode"], "HTML");

        let plain = TelegramNotifier::new("123:abc", ParseMode::Plain).unwrap();
        assert!(plain.payload("42", &notification("s", "b")).get("parse_mode").is_none());
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let limited = response(serde_json::json!({
            "ok": false,
            "description": "Too Many Requests: retry after 17",
            "parameters": { "retry_after": 17 }
        }));
        assert!(matches!(
            check_response(StatusCode::TOO_MANY_REQUESTS, limited),
            Err(NotifyError::RateLimited { retry_after_secs: 17 })
        ));

        let bare = response(serde_json::json!({ "ok": false }));
        assert!(matches!(
            check_response(StatusCode::TOO_MANY_REQUESTS, bare),
            Err(NotifyError::RateLimited { retry_after_secs: DEFAULT_RETRY_AFTER_SECS })
        ));
    }

    #[test]
    fn rejection_keeps_api_description() {
        let rejected = response(serde_json::json!({
            "ok": false,
            "description": "Bad Request: chat not found"
        }));
        match check_response(StatusCode::BAD_REQUEST, rejected) {
            Err(NotifyError::Rejected { status, description }) => {
                assert_eq!(status, 400);
                assert!(description.contains("chat not found"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(check_response(StatusCode::OK, response(serde_json::json!({ "ok": true }))).is_ok());
    }

    #[test]
    fn token_reference_resolves_from_env() {
        std::env::set_var("PVWATCH_TEST_TG_TOKEN", "987:xyz");
        assert_eq!(resolve_token("${PVWATCH_TEST_TG_TOKEN}").unwrap(), "987:xyz");
        std::env::remove_var("PVWATCH_TEST_TG_TOKEN");

        assert_eq!(resolve_token("555:literal").unwrap(), "555:literal");
        assert!(resolve_token("${PVWATCH_TEST_TG_UNSET_TOKEN}").is_err());
        assert!(resolve_token("${BROKEN").is_err());
        assert!(resolve_token("").is_err());
    }

    #[test]
    fn from_config_requires_token() {
        let mut config = TelegramConfig {
            bot_token: None,
            admin_chat_id: Some("1".to_string()),
            parse_mode: Some("MarkdownV2".to_string()),
        };
        assert!(TelegramNotifier::from_config(&config).is_err());

        config.bot_token = Some("123:abc".to_string());
        let notifier = TelegramNotifier::from_config(&config).unwrap();
        assert_eq!(notifier.parse_mode(), ParseMode::MarkdownV2);
        assert_eq!(notifier.channel_name(), "telegram");
    }
}
