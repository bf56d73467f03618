use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::SosStatusEvent;

const GLOBAL_CHANNEL_CAPACITY: usize = 1000;
const BOOKING_CHANNEL_CAPACITY: usize = 100;

/// Fan-out for SOS status events: one channel per booking for the owner's
/// live view, plus one global channel for dashboards. Subscribers joining
/// late only see events sent after they subscribed.
pub struct SosEventChannel {
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<String>>>>,
    global_sender: broadcast::Sender<String>,
}

impl SosEventChannel {
    pub fn new() -> Self {
        let (global_sender, _) = broadcast::channel(GLOBAL_CHANNEL_CAPACITY);
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            global_sender,
        }
    }

    /// Serialize once, push to the booking channel and the global one. A
    /// send failure only means nobody is listening right now.
    pub async fn publish(&self, event: &SosStatusEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "Failed to serialize SOS event for booking {}: {}",
                    event.booking_id, e
                );
                return;
            }
        };

        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&event.booking_id) {
                if let Err(e) = sender.send(payload.clone()) {
                    debug!("No subscribers for booking {}: {}", event.booking_id, e);
                }
            }
        }

        if let Err(e) = self.global_sender.send(payload) {
            debug!("No global subscribers: {}", e);
        }
    }

    /// Subscribe to one booking's events, creating its channel on first use.
    pub async fn subscribe(&self, booking_id: Uuid) -> broadcast::Receiver<String> {
        let mut channels = self.channels.write().await;
        channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(BOOKING_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<String> {
        self.global_sender.subscribe()
    }

    /// Drop a finished booking's channel. Existing receivers keep draining
    /// whatever was already sent.
    pub async fn remove_channel(&self, booking_id: Uuid) {
        let mut channels = self.channels.write().await;
        if channels.remove(&booking_id).is_some() {
            debug!("Removed SOS event channel for booking {}", booking_id);
        }
    }
}

impl Default for SosEventChannel {
    fn default() -> Self {
        Self::new()
    }
}
