//! Routes alarm notification intents to configured channels.
//!
//! Each intent is rendered once and delivered to every recipient on every
//! channel. Individual delivery failures are logged and counted; they never
//! block other recipients or channels, and nothing is retried here.

use pvwatch_core::NotificationIntent;

use crate::templating::TemplateRenderer;
use crate::traits::{DispatchResult, Notifier, NotifyError};

/// Delivery totals for a batch of intents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSummary {
    pub delivered: usize,
    /// Failed sends, rate-limited ones included.
    pub failed: usize,
    pub rate_limited: usize,
    /// Longest wait any channel asked for in this batch.
    pub retry_after_secs: Option<u64>,
}

impl NotificationSummary {
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}

/// Dispatches notifications to every configured channel.
pub struct Dispatcher {
    channels: Vec<Box<dyn Notifier>>,
    renderer: TemplateRenderer,
}

impl Dispatcher {
    /// Create a dispatcher with the given channels and renderer.
    pub fn new(channels: Vec<Box<dyn Notifier>>, renderer: TemplateRenderer) -> Self {
        Self { channels, renderer }
    }

    /// Create an empty dispatcher.
    pub fn empty() -> Self {
        Self::new(Vec::new(), TemplateRenderer::new())
    }

    /// Create a dispatcher using the built-in templates.
    pub fn with_defaults(channels: Vec<Box<dyn Notifier>>) -> Self {
        Self::new(channels, TemplateRenderer::new())
    }

    pub fn add_channel(&mut self, channel: Box<dyn Notifier>) {
        self.channels.push(channel);
    }

    /// Deliver one intent to all of its recipients on all channels.
    ///
    /// Returns one result per (channel, recipient) pair.
    pub async fn dispatch(&self, intent: &NotificationIntent) -> Vec<DispatchResult> {
        let alarm_key = format!(
            "{}/{} {} [{}]",
            intent.plant, intent.inverter, intent.rule_type, intent.problem_detail
        );

        if self.channels.is_empty() {
            tracing::debug!(alarm_key = %alarm_key, "No notification channels configured");
            return Vec::new();
        }

        if intent.recipients.is_empty() {
            tracing::warn!(alarm_key = %alarm_key, "Notification has no recipients");
            return Vec::new();
        }
        let recipients: Vec<&str> = intent.recipients.all().collect();

        let notification = match self.renderer.render_intent(intent) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(alarm_key = %alarm_key, error = %e, "Notification rendering failed");
                let mut failed = Vec::with_capacity(self.channels.len() * recipients.len());
                for channel in &self.channels {
                    for recipient in &recipients {
                        failed.push(DispatchResult {
                            channel: channel.channel_name().to_string(),
                            recipient: recipient.to_string(),
                            alarm_key: alarm_key.clone(),
                            success: false,
                            error: Some(e.to_string()),
                            retry_after_secs: None,
                            duration_ms: 0,
                        });
                    }
                }
                return failed;
            }
        };

        let mut results = Vec::with_capacity(self.channels.len() * recipients.len());

        for channel in &self.channels {
            for recipient in &recipients {
                let start = std::time::Instant::now();
                let result = channel.send(recipient, &notification).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                let (success, error, retry_after_secs) = match result {
                    Ok(()) => {
                        tracing::info!(
                            alarm_key = %alarm_key,
                            channel = channel.channel_name(),
                            recipient,
                            duration_ms,
                            "Notification delivered"
                        );
                        (true, None, None)
                    }
                    Err(e) => {
                        tracing::warn!(
                            alarm_key = %alarm_key,
                            channel = channel.channel_name(),
                            recipient,
                            error = %e,
                            duration_ms,
                            "Notification delivery failed"
                        );
                        (false, Some(e.to_string()), e.retry_after_secs())
                    }
                };

                results.push(DispatchResult {
                    channel: channel.channel_name().to_string(),
                    recipient: recipient.to_string(),
                    alarm_key: alarm_key.clone(),
                    success,
                    error,
                    retry_after_secs,
                    duration_ms,
                });
            }
        }

        results
    }

    /// Deliver a batch of intents in order and total the outcome.
    pub async fn dispatch_all(&self, intents: &[NotificationIntent]) -> NotificationSummary {
        let mut summary = NotificationSummary::default();
        for intent in intents {
            for result in self.dispatch(intent).await {
                if result.success {
                    summary.delivered += 1;
                } else {
                    summary.failed += 1;
                }
                if let Some(wait) = result.retry_after_secs {
                    summary.rate_limited += 1;
                    summary.retry_after_secs = summary.retry_after_secs.max(Some(wait));
                }
            }
        }
        summary
    }

    /// Send a test notification through one channel by index.
    pub async fn test_notify(&self, channel_index: usize, recipient: &str) -> Result<(), NotifyError> {
        let channel = self
            .channels
            .get(channel_index)
            .ok_or_else(|| NotifyError::Config(format!("Channel index {channel_index} out of range")))?;

        channel.test(recipient).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templating::MessageTemplates;
    use crate::traits::Notification;
    use chrono::Utc;
    use pvwatch_core::{NotificationKind, Recipients, RuleType, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct MockNotifier {
        name: String,
        send_count: Arc<AtomicUsize>,
        recipients: Arc<Mutex<Vec<String>>>,
        fail_for: Option<String>,
    }

    impl MockNotifier {
        fn new(name: &str, fail_for: Option<&str>) -> (Self, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
            let count = Arc::new(AtomicUsize::new(0));
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    name: name.to_string(),
                    send_count: count.clone(),
                    recipients: seen.clone(),
                    fail_for: fail_for.map(String::from),
                },
                count,
                seen,
            )
        }
    }

    #[async_trait::async_trait]
    impl Notifier for MockNotifier {
        async fn send(&self, recipient: &str, _notification: &Notification) -> Result<(), NotifyError> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            self.recipients.lock().unwrap().push(recipient.to_string());
            if self.fail_for.as_deref() == Some(recipient) {
                Err(NotifyError::Config("mock failure".to_string()))
            } else {
                Ok(())
            }
        }
        fn channel_name(&self) -> &str {
            &self.name
        }
    }

    fn intent(owner: Option<&str>) -> NotificationIntent {
        NotificationIntent {
            kind: NotificationKind::Opened,
            plant: "p1".to_string(),
            inverter: "inv1".to_string(),
            rule_type: RuleType::StringDown,
            problem_detail: "String 2".to_string(),
            severity: Severity::High,
            message: "String 2 down".to_string(),
            at: Utc::now(),
            recipients: Recipients::new(Some("admin-chat"), owner),
        }
    }

    #[tokio::test]
    async fn delivers_to_admin_and_distinct_owner() {
        let (mock, count, seen) = MockNotifier::new("mock", None);
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(mock)]);

        let results = dispatcher.dispatch(&intent(Some("owner-chat"))).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["admin-chat", "owner-chat"]);
    }

    #[tokio::test]
    async fn owner_equal_to_admin_gets_one_message() {
        let (mock, count, _) = MockNotifier::new("mock", None);
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(mock)]);

        let results = dispatcher.dispatch(&intent(Some("admin-chat"))).await;
        assert_eq!(results.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_failure_doesnt_block() {
        let (mock, count, _) = MockNotifier::new("mock", Some("admin-chat"));
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(mock)]);

        let results = dispatcher.dispatch(&intent(Some("owner-chat"))).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(count.load(Ordering::SeqCst), 2); // owner still sent
    }

    #[tokio::test]
    async fn dispatch_all_totals_outcomes() {
        let (mock, _, _) = MockNotifier::new("mock", Some("owner-chat"));
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(mock)]);

        let summary = dispatcher
            .dispatch_all(&[intent(Some("owner-chat")), intent(None)])
            .await;
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rate_limited, 0);
        assert!(summary.is_degraded());
    }

    #[tokio::test]
    async fn missing_admin_sends_to_owner_only() {
        let (mock, _, seen) = MockNotifier::new("mock", None);
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(mock)]);
        let mut owner_only = intent(Some("owner-chat"));
        owner_only.recipients = Recipients::new(None, Some("owner-chat"));
        let mut nobody = intent(None);
        nobody.recipients = Recipients::new(None, None);

        let summary = dispatcher.dispatch_all(&[owner_only, nobody]).await;
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(*seen.lock().unwrap(), vec!["owner-chat"]);
    }

    /// Rate limits every send with a fixed wait.
    struct ThrottledNotifier(u64);

    #[async_trait::async_trait]
    impl Notifier for ThrottledNotifier {
        async fn send(&self, _recipient: &str, _notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::RateLimited { retry_after_secs: self.0 })
        }
        fn channel_name(&self) -> &str {
            "throttled"
        }
    }

    #[tokio::test]
    async fn rate_limits_surface_longest_wait() {
        let dispatcher = Dispatcher::with_defaults(vec![
            Box::new(ThrottledNotifier(12)),
            Box::new(ThrottledNotifier(40)),
        ]);

        let summary = dispatcher.dispatch_all(&[intent(None)]).await;
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.rate_limited, 2);
        assert_eq!(summary.retry_after_secs, Some(40));
    }

    #[tokio::test]
    async fn no_channels_returns_empty() {
        let dispatcher = Dispatcher::empty();
        assert!(dispatcher.dispatch(&intent(None)).await.is_empty());
        assert_eq!(dispatcher.dispatch_all(&[intent(None)]).await, NotificationSummary::default());
    }

    #[tokio::test]
    async fn render_failure_counts_every_recipient_as_failed() {
        let (mock, count, _) = MockNotifier::new("mock", None);
        let templates = MessageTemplates {
            // Parses, but fails at render time on the undefined call.
            opened_body: "{{ missing_fn() }}".to_string(),
            ..MessageTemplates::default()
        };
        let renderer = TemplateRenderer::with_templates(templates).unwrap();
        let dispatcher = Dispatcher::new(vec![Box::new(mock)], renderer);

        let results = dispatcher.dispatch(&intent(Some("owner-chat"))).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_notify_rejects_unknown_channel() {
        let dispatcher = Dispatcher::empty();
        assert!(dispatcher.test_notify(0, "admin-chat").await.is_err());
    }
}
