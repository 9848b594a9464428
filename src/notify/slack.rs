//! Slack Incoming Webhook client.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Slack limits a section block to ten fields.
const MAX_SECTION_FIELDS: usize = 10;

/// Block Kit message: a header, labelled fields and a context line.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

impl SlackMessage {
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    fn to_payload(&self) -> Value {
        let mut blocks = vec![json!({
            "type": "header",
            "text": { "type": "plain_text", "text": self.header, "emoji": true }
        })];

        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|(label, value)| json!({ "type": "mrkdwn", "text": format!("*{label}*\n{value}") }))
            .collect();
        blocks.extend(
            fields
                .chunks(MAX_SECTION_FIELDS)
                .map(|chunk| json!({ "type": "section", "fields": chunk })),
        );

        blocks.push(json!({ "type": "divider" }));
        blocks.push(json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": self.context }]
        }));

        json!({
            "text": format!("{}\n{}", self.header, self.context),
            "blocks": blocks,
        })
    }
}

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, message: &SlackMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message.to_payload())
            .send()
            .await
            .context("Failed to reach Slack webhook")?;
        if !response.status().is_success() {
            bail!("Slack webhook returned {}", response.status());
        }
        Ok(())
    }

    /// Deliver a message. Failures are logged and never reach the plan.
    pub async fn send(&self, plan_id: &str, message: &SlackMessage) {
        match self.post(message).await {
            Ok(()) => info!(plan = plan_id, header = %message.header, "Slack notification sent"),
            Err(e) => warn!(plan = plan_id, error = %e, "Failed to send Slack notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(fields: usize) -> SlackMessage {
        SlackMessage {
            header: "Upgrade Completed".to_string(),
            fields: (0..fields)
                .map(|i| (format!("Label {i}"), format!("value {i}")))
                .collect(),
            context: "Sent by ecup".to_string(),
        }
    }

    #[test]
    fn test_payload_blocks() {
        let payload = message(2).to_payload();
        let blocks = payload["blocks"].as_array().unwrap();
        let kinds: Vec<&str> = blocks.iter().map(|b| b["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["header", "section", "divider", "context"]);
        assert_eq!(blocks[1]["fields"][0]["text"], "*Label 0*\nvalue 0");
        assert_eq!(payload["text"], "Upgrade Completed\nSent by ecup");
    }

    #[test]
    fn test_payload_splits_sections() {
        let payload = message(12).to_payload();
        let sections: Vec<&Value> = payload["blocks"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|b| b["type"] == "section")
            .collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1]["fields"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_payload_without_fields() {
        let payload = message(0).to_payload();
        assert_eq!(payload["blocks"].as_array().unwrap().len(), 3);
    }
}
