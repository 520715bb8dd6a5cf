//! Minijinja template rendering for alarm notifications.
//!
//! Renders notification subject and body templates using minijinja, with
//! access to the alarm that was opened or cleared.
//!
//! Templates are arbitrary strings (not pre-registered), so a fresh
//! [`minijinja::Environment`] is created per render call.

use std::collections::HashMap;

use pvwatch_core::{NotificationIntent, NotificationKind};

use crate::traits::{Notification, NotifyError};

/// Default subject template.
pub const DEFAULT_SUBJECT: &str =
    "[{{ alarm.severity | upper }}] {{ alarm.rule_type }} {{ event }} at {{ alarm.plant }}/{{ alarm.inverter }}";

/// Default body for a newly opened alarm.
pub const DEFAULT_OPENED_BODY: &str = "\u{1F6A8} Alarm opened ({{ alarm.severity | upper }})
Plant: {{ alarm.plant }}
Inverter: {{ alarm.inverter }}
Problem: {{ alarm.rule_type }} - {{ alarm.detail }}
{{ alarm.message }}
Since: {{ now }}";

/// Default body for a cleared alarm.
pub const DEFAULT_CLEARED_BODY: &str = "\u{2705} Alarm cleared
Plant: {{ alarm.plant }}
Inverter: {{ alarm.inverter }}
Problem: {{ alarm.rule_type }} - {{ alarm.detail }}
Cleared: {{ now }}";

/// Context data available to notification templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateContext {
    pub alarm: AlarmContext,
    /// Event type: `"opened"` or `"cleared"`.
    pub event: String,
    /// Event timestamp in ISO 8601 format.
    pub now: String,
}

/// Alarm fields exposed to templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlarmContext {
    pub plant: String,
    pub inverter: String,
    pub rule_type: String,
    pub detail: String,
    pub severity: String,
    pub message: String,
}

impl From<&NotificationIntent> for TemplateContext {
    fn from(intent: &NotificationIntent) -> Self {
        Self {
            alarm: AlarmContext {
                plant: intent.plant.clone(),
                inverter: intent.inverter.clone(),
                rule_type: intent.rule_type.as_str().to_string(),
                detail: intent.problem_detail.clone(),
                severity: intent.severity.as_str().to_string(),
                message: intent.message.clone(),
            },
            event: intent.kind.as_str().to_string(),
            now: intent.at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Subject and body templates for both notification kinds.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    pub subject: String,
    pub opened_body: String,
    pub cleared_body: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            opened_body: DEFAULT_OPENED_BODY.to_string(),
            cleared_body: DEFAULT_CLEARED_BODY.to_string(),
        }
    }
}

/// Renders notification templates using minijinja.
#[derive(Debug, Default)]
pub struct TemplateRenderer {
    templates: MessageTemplates,
}

impl TemplateRenderer {
    /// Create a renderer with the built-in templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a renderer with custom templates.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if any template has syntax errors.
    pub fn with_templates(templates: MessageTemplates) -> Result<Self, NotifyError> {
        let renderer = Self { templates };
        renderer.validate(&renderer.templates.subject)?;
        renderer.validate(&renderer.templates.opened_body)?;
        renderer.validate(&renderer.templates.cleared_body)?;
        Ok(renderer)
    }

    /// Build a configured minijinja environment with custom filters.
    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();

        env.add_filter("round", round_filter);

        // `lower` and `upper` are built-in with the "builtins" feature,
        // but we register explicit versions to guarantee availability.
        env.add_filter("lower", lower_filter);
        env.add_filter("upper", upper_filter);

        env
    }

    /// Render a template string with the given context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render(&self, template_str: &str, ctx: &TemplateContext) -> Result<String, NotifyError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Validate that a template string parses without errors.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }

    /// Render the notification for one intent.
    pub fn render_intent(&self, intent: &NotificationIntent) -> Result<Notification, NotifyError> {
        let ctx = TemplateContext::from(intent);
        let body_template = match intent.kind {
            NotificationKind::Opened => &self.templates.opened_body,
            NotificationKind::Cleared => &self.templates.cleared_body,
        };

        Ok(Notification {
            subject: self.render(&self.templates.subject, &ctx)?,
            body: self.render(body_template, &ctx)?,
            metadata: HashMap::from([
                ("event".to_string(), ctx.event.clone()),
                ("rule_type".to_string(), ctx.alarm.rule_type.clone()),
                ("severity".to_string(), ctx.alarm.severity.clone()),
                (
                    "alarm_key".to_string(),
                    format!(
                        "{}/{} {} [{}]",
                        ctx.alarm.plant, ctx.alarm.inverter, ctx.alarm.rule_type, ctx.alarm.detail
                    ),
                ),
            ]),
        })
    }
}

/// Custom filter: round a float to N decimal places.
fn round_filter(value: f64, decimals: Option<u32>) -> String {
    let n = decimals.unwrap_or(0);
    format!("{:.prec$}", value, prec = n as usize)
}

/// Custom filter: lowercase a string.
fn lower_filter(value: String) -> String {
    value.to_lowercase()
}

/// Custom filter: uppercase a string.
fn upper_filter(value: String) -> String {
    value.to_uppercase()
}
