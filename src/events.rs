use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Event taxonomy of the append-only NDJSON log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SignalReceived,
    RiskCheckPassed,
    RiskCheckFailed,
    OrderPlaced,
    PositionOpened,
    PositionClosed,
    ReconcileOk,
    ReconcileDrift,
    NotificationSent,
    NotificationFailed,
    DaemonStarted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SignalReceived => "signal_received",
            EventType::RiskCheckPassed => "risk_check_passed",
            EventType::RiskCheckFailed => "risk_check_failed",
            EventType::OrderPlaced => "order_placed",
            EventType::PositionOpened => "position_opened",
            EventType::PositionClosed => "position_closed",
            EventType::ReconcileOk => "reconcile_ok",
            EventType::ReconcileDrift => "reconcile_drift",
            EventType::NotificationSent => "notification_sent",
            EventType::NotificationFailed => "notification_failed",
            EventType::DaemonStarted => "daemon_started",
        }
    }
}

/// Append-only event log, one JSON object per line. Emission failures are
/// logged and swallowed: the event log must never take the trading path down.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub async fn emit(&self, event_type: EventType, data: serde_json::Value) {
        if let Err(e) = self.write_line(event_type, data).await {
            warn!("event log write failed: {}", e);
        }
    }

    async fn write_line(&self, event_type: EventType, data: serde_json::Value) -> Result<()> {
        let line = json!({
            "type": event_type.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().unwrap();
        file.write_all(line.to_string().as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}
