//! Fire-and-forget publication of status changes, KPIs and alerts.

use crate::state::FeedStatus;
use roadview_core::CongestionLevel;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Aggregate indicators across all feeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub active_feeds: usize,
    pub total_vehicles: usize,
    /// Mean over feeds that have reported at least one frame
    pub avg_speed_kmh: f64,
    pub per_feed: Vec<FeedKpi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedKpi {
    pub feed_id: String,
    pub vehicle_count: usize,
    pub avg_speed_kmh: f64,
    pub congestion: CongestionLevel,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Everything the supervisor publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    FeedStatus {
        feed_id: String,
        from: FeedStatus,
        to: FeedStatus,
        message: Option<String>,
    },
    Kpis(KpiSnapshot),
    Alert {
        level: AlertLevel,
        feed_id: Option<String>,
        message: String,
    },
}

/// Destination for supervisor events. Delivery is the sink's concern;
/// `publish` must not block.
pub trait BroadcastSink: Send + Sync + 'static {
    fn publish(&self, event: SupervisorEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl BroadcastSink for TracingSink {
    fn publish(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::FeedStatus {
                feed_id,
                from,
                to,
                message,
            } => match message {
                Some(msg) => info!("[{}] {} -> {}: {}", feed_id, from, to, msg),
                None => info!("[{}] {} -> {}", feed_id, from, to),
            },
            SupervisorEvent::Kpis(kpis) => info!(
                "KPIs: {} active feeds, {} vehicles, {:.1} km/h avg",
                kpis.active_feeds, kpis.total_vehicles, kpis.avg_speed_kmh
            ),
            SupervisorEvent::Alert {
                level,
                feed_id,
                message,
            } => warn!("Alert {:?} [{}]: {}", level, feed_id.as_deref().unwrap_or("-"), message),
        }
    }
}

/// Fans events out to in-process subscribers. Events published with no
/// subscriber are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }
}

impl BroadcastSink for ChannelSink {
    fn publish(&self, event: SupervisorEvent) {
        let _ = self.sender.send(event);
    }
}
