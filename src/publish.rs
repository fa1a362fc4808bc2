use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::{LeadRecord, MessageRecord, RoomRecord};
use crate::ws::WsEvent;

pub const EVENT_ROOM_CREATED: &str = "room_created";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_STATUS: &str = "status";

/// Realtime fan-out port. Components receive this by value at
/// construction; there is no ambient global channel.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<WsEvent>,
}

impl Publisher {
    pub fn new(tx: broadcast::Sender<WsEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    /// One atomic announcement for a fresh conversation: the room, its
    /// contact (explicit null when unlinked), and the first message
    /// travel together so observers never see a room without content.
    pub fn room_created(
        &self,
        room: &RoomRecord,
        lead: Option<&LeadRecord>,
        message: &MessageRecord,
    ) {
        let payload = json!({
            "room_id": room.id,
            "room": room,
            "lead": lead,
            "message": message,
        });
        self.emit(EVENT_ROOM_CREATED, payload);
    }

    pub fn message(&self, message: &MessageRecord) {
        let payload = json!({
            "room_id": message.room_id,
            "message": message,
        });
        self.emit(EVENT_MESSAGE, payload);
    }

    pub fn status(&self, message: &MessageRecord) {
        let payload = json!({
            "room_id": message.room_id,
            "external_id": message.external_id,
            "delivery_status": message.delivery_status,
            "status_at": message.status_at,
            "message": message,
        });
        self.emit(EVENT_STATUS, payload);
    }

    // A send error only means no observer is connected; the persisted
    // record is the source of truth, so this never propagates.
    fn emit(&self, event: &str, payload: Value) {
        let result = self.tx.send(WsEvent {
            event: event.to_string(),
            payload,
        });
        if let Err(err) = result {
            debug!(event, error = %err, "no realtime observers for event");
        }
    }
}
