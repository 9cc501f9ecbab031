//! Change notifications.
//!
//! Fire-and-forget: a sink never blocks the orchestrator and never reports
//! failure back to it.

use crate::config::NotifyConfig;
use crate::target::TargetId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A target's item count moved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub target_id: TargetId,
    pub url: String,
    pub previous: u64,
    pub current: u64,
    pub delta: i64,
    pub observed_at: DateTime<Utc>,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: ChangeNotice);
}

/// Logs every change. Always installed.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: ChangeNotice) {
        info!(
            target_id = %notice.target_id,
            url = %notice.url,
            previous = notice.previous,
            current = notice.current,
            delta = notice.delta,
            "item count changed"
        );
    }
}

/// POSTs the notice as JSON. Must be called from inside a tokio runtime.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl NotificationSink for WebhookSink {
    fn notify(&self, notice: ChangeNotice) {
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&notice).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), target_id = %notice.target_id, "webhook rejected change notice");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, target_id = %notice.target_id, "webhook delivery failed");
                }
            }
        });
    }
}

/// Fans a notice out to several sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut notifier = Self::new().with_sink(Arc::new(LogSink));
        if config.enabled {
            match &config.webhook_url {
                Some(url) => {
                    info!(url = %url, "change webhook enabled");
                    notifier = notifier.with_sink(Arc::new(WebhookSink::new(url.clone())));
                }
                None => warn!("notifications enabled without a webhook url, logging changes only"),
            }
        }
        notifier
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for Notifier {
    fn notify(&self, notice: ChangeNotice) {
        for sink in &self.sinks {
            sink.notify(notice.clone());
        }
    }
}
