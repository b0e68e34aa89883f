//! Push notification publisher (ntfy)
//!
//! Delivery failures are logged and absorbed; the next escalation retries
//! anyway. With no topic configured the publisher is a no-op.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::types::Reminder;

pub struct Notifier {
    client: reqwest::Client,
    server: String,
    topic: String,
    client_base_url: String,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            topic: config.topic.clone(),
            client_base_url: config.client_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn enabled(&self) -> bool {
        !self.topic.is_empty()
    }

    fn publish_url(&self) -> String {
        format!("{}/{}", self.server, self.topic)
    }

    fn reminder_url(&self, reminder_id: &str) -> String {
        format!("{}/reminder/{}", self.client_base_url, reminder_id)
    }

    /// Escalation level maps to delivery priority
    fn priority_for_level(level: i64) -> &'static str {
        match level {
            0 => "default",
            1 | 2 => "high",
            _ => "urgent",
        }
    }

    /// Publish a check-in notification. Level 0 is the initial delivery;
    /// higher levels are escalation re-deliveries.
    pub async fn send_reminder(&self, reminder: &Reminder, level: i64) {
        if !self.enabled() {
            return;
        }
        let url = self.reminder_url(&reminder.id);
        let title = if level == 0 { "Time to check in" } else { "Still waiting on your check-in" };
        // Generic body, no personal content in the push payload
        let body = format!("Tap to answer {} quick questions", reminder.questions.len());

        let result = self
            .client
            .post(self.publish_url())
            .header("Title", title)
            .header("Priority", Self::priority_for_level(level))
            .header("Tags", "clipboard")
            .header("Click", &url)
            .header("Actions", format!("view, Open, {}", url))
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => {
                info!(reminder_id = %reminder.id, level, "Sent reminder notification")
            }
            Err(e) => {
                warn!(reminder_id = %reminder.id, level, error = %e, "Failed to send notification")
            }
        }
    }
}
