use super::{ReportEvent, ReportSink};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, event: &ReportEvent) -> serde_json::Value {
        json!({
            "source": "sharemirror",
            "backup_name": event.backup_name(),
            "event": event,
        })
    }
}

#[async_trait]
impl ReportSink for WebhookSink {
    async fn report(&self, event: &ReportEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&self.payload(event))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
