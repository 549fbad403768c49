use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::events::{EventLog, EventType};

/// Delivery channel for outbound notifications. Real transports (WhatsApp,
/// email) live outside the core and plug in here; the default writes to the
/// process log and cannot fail.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, subject: &str, body: &str) -> Result<(), String>;
}

pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, subject: &str, body: &str) -> Result<(), String> {
        info!("notification: {}: {}", subject, body);
        Ok(())
    }
}

/// Fans notifications out through the configured transport and records the
/// outcome (sent or failed) in the event log.
pub struct NotificationManager {
    events: Arc<EventLog>,
    transport: Arc<dyn NotificationTransport>,
    enabled: bool,
}

impl NotificationManager {
    pub fn new(events: Arc<EventLog>, enabled: bool) -> Self {
        Self::with_transport(events, Arc::new(LogTransport), enabled)
    }

    pub fn with_transport(
        events: Arc<EventLog>,
        transport: Arc<dyn NotificationTransport>,
        enabled: bool,
    ) -> Self {
        Self {
            events,
            transport,
            enabled,
        }
    }

    pub async fn notify(&self, subject: &str, body: &str) {
        if !self.enabled {
            return;
        }
        match self.transport.deliver(subject, body).await {
            Ok(()) => {
                self.events
                    .emit(
                        EventType::NotificationSent,
                        json!({"subject": subject, "body": body}),
                    )
                    .await;
            }
            Err(error) => self.notify_failure(subject, &error).await,
        }
    }

    async fn notify_failure(&self, subject: &str, error: &str) {
        warn!("notification failed: {}: {}", subject, error);
        self.events
            .emit(
                EventType::NotificationFailed,
                json!({"subject": subject, "error": error}),
            )
            .await;
    }

    pub async fn position_opened(&self, coin: &str, direction: &str, size: f64, entry: f64) {
        self.notify(
            &format!("Position opened: {} {}", direction, coin),
            &format!("size {:.6} @ {:.4}", size, entry),
        )
        .await;
    }

    pub async fn position_closed(&self, coin: &str, pnl: f64, reason: &str) {
        self.notify(
            &format!("Position closed: {}", coin),
            &format!("pnl {:.2} ({})", pnl, reason),
        )
        .await;
    }

    pub async fn drift_detected(&self, coin: &str, message: &str) {
        self.notify(&format!("Reconcile drift: {}", coin), message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FailingTransport;

    #[async_trait]
    impl NotificationTransport for FailingTransport {
        async fn deliver(&self, _subject: &str, _body: &str) -> Result<(), String> {
            Err("gateway unreachable".to_string())
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("notify-{}.ndjson", uuid::Uuid::new_v4()))
    }

    fn read_types(path: &PathBuf) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_string))
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_delivery_records_sent() {
        let path = temp_path();
        let manager = NotificationManager::new(Arc::new(EventLog::new(&path)), true);
        manager.notify("Position opened: long ETH", "size 2 @ 100").await;
        assert_eq!(read_types(&path), vec!["notification_sent"]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn failed_delivery_records_failure() {
        let path = temp_path();
        let manager = NotificationManager::with_transport(
            Arc::new(EventLog::new(&path)),
            Arc::new(FailingTransport),
            true,
        );
        manager.notify("Reconcile drift: ETH", "size drift").await;
        assert_eq!(read_types(&path), vec!["notification_failed"]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn disabled_manager_stays_silent() {
        let path = temp_path();
        let manager = NotificationManager::new(Arc::new(EventLog::new(&path)), false);
        manager.notify("Position closed: ETH", "pnl 5.00").await;
        assert!(read_types(&path).is_empty());
        std::fs::remove_file(&path).ok();
    }
}
