mod webhook;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{ReportChannelType, ReportConfig};
use crate::core::models::RunReport;

pub use webhook::WebhookSink;

/// Terminal outcome of one orchestrator invocation, as handed to reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportEvent {
    Completed(RunReport),
    Skipped { backup_name: String },
    Failed { backup_name: String, error: String },
}

impl ReportEvent {
    pub fn backup_name(&self) -> &str {
        match self {
            Self::Completed(report) => &report.backup_name,
            Self::Skipped { backup_name } | Self::Failed { backup_name, .. } => backup_name,
        }
    }
}

/// Receives structured run results. Formatting for humans is the sink's business.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, event: &ReportEvent) -> anyhow::Result<()>;
}

/// Writes events to the tracing log.
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn report(&self, event: &ReportEvent) -> anyhow::Result<()> {
        match event {
            ReportEvent::Completed(r) => info!(
                backup = %r.backup_name,
                host = %r.selected_host,
                copied = r.copied_files,
                skipped = r.skipped_files,
                failed = r.failed_files,
                bytes = r.total_bytes,
                duration_secs = r.duration_secs,
                "Replication completed"
            ),
            ReportEvent::Skipped { backup_name } => {
                info!(backup = %backup_name, "Replication skipped, already running")
            }
            ReportEvent::Failed { backup_name, error } => {
                error!(backup = %backup_name, error = %error, "Replication failed")
            }
        }
        Ok(())
    }
}

pub fn create_sink(config: &ReportConfig) -> Option<Arc<dyn ReportSink>> {
    match config.channel {
        ReportChannelType::None => None,
        ReportChannelType::Log => Some(Arc::new(LogSink)),
        ReportChannelType::Webhook => {
            let url = config.webhook_url.as_ref().filter(|u| !u.is_empty());
            match url {
                Some(url) => Some(Arc::new(WebhookSink::new(url.clone()))),
                None => {
                    warn!("Webhook reporting selected without webhook_url, falling back to log");
                    Some(Arc::new(LogSink))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_outcome_tag() {
        let event = ReportEvent::Failed {
            backup_name: "LV1".into(),
            error: "no host reachable".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["backup_name"], "LV1");

        let completed = ReportEvent::Completed(RunReport::new("LV2", "nas1", Vec::new(), 1));
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["selected_host"], "nas1");
        assert_eq!(completed.backup_name(), "LV2");
    }

    #[test]
    fn factory_honours_channel() {
        let none = ReportConfig {
            channel: ReportChannelType::None,
            webhook_url: None,
        };
        assert!(create_sink(&none).is_none());

        let webhook_without_url = ReportConfig {
            channel: ReportChannelType::Webhook,
            webhook_url: Some(String::new()),
        };
        assert!(create_sink(&webhook_without_url).is_some());
    }
}
