use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Domain events emitted by the inventory and reconciliation services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Case events
    CaseCreated {
        case_id: Uuid,
        trip_id: Option<Uuid>,
    },
    CaseUpdated(Uuid),
    CaseDeleted(Uuid),
    CaseCompleted(Uuid),
    CaseCompletionReversed(Uuid),

    // Trip events
    TripCreated(Uuid),
    TripCompleted(Uuid),
    TripReopened(Uuid),
    TripDeleted(Uuid),
    PoolItemsAssigned {
        trip_id: Uuid,
        case_id: Uuid,
        count: usize,
    },
    PoolItemsReturned {
        trip_id: Uuid,
        count: usize,
    },

    // Stock events
    StockReceived {
        txn_id: Uuid,
        spec_no: String,
        qty: i32,
    },
    StockShipped {
        txn_id: Uuid,
        spec_no: String,
        qty: i32,
    },
    StockMovedToDemo {
        txn_id: Uuid,
        spec_no: String,
        qty: i32,
    },
    TransactionDeleted(Uuid),
}

/// Consumes domain events from the channel and logs them. Runs until the
/// sending side is dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = receiver.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = %payload, "Domain event"),
            Err(e) => warn!("Failed to serialize event for logging: {}", e),
        }
    }
    info!("Event processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_through_the_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        sender
            .send(Event::CaseCompleted(Uuid::new_v4()))
            .await
            .expect("send event");

        match rx.recv().await {
            Some(Event::CaseCompleted(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
