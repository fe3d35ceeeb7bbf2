#![allow(dead_code)]
//! Fire-and-forget signal bus toward the host platform. Senders never
//! block and never fail; a signal with no listeners is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::ExportRule;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ForceChargeState {
        active: bool,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    ForceDischargeState {
        active: bool,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    CurtailmentUpdated {
        export_rule: ExportRule,
        inverter_curtailed: bool,
        power_limit_w: Option<f64>,
    },
    TariffUpdated {
        buy_cents: f64,
        sell_cents: f64,
        stage: &'static str,
    },
    BatteryHealthUpdate {
        soc: f64,
    },
    /// Elevated, user-facing message (push notification in the host).
    UserNotification {
        title: String,
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::BatteryHealthUpdate { soc: 55.0 });
        match rx.recv().await.unwrap() {
            Event::BatteryHealthUpdate { soc } => assert_eq!(soc, 55.0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(Event::UserNotification {
            title: "t".to_string(),
            message: "m".to_string(),
        });
    }
}
