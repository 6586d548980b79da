//! Event ingress: from raw transport frames to state transitions.
//!
//! Every inbound frame passes through [`EventIngress::handle_event`]:
//!
//! 1. tolerant decode ([`protocol::decode_payload`] — raw object or one
//!    level of JSON-string double-encoding),
//! 2. room resolution (payload `roomId`/`group`, falling back to the
//!    connection's room; absent everywhere is the one hard error),
//! 3. fail-soft parse into a [`ClientEvent`] — an unknown or malformed
//!    event is logged and acknowledged as a no-op so a protocol hiccup
//!    never costs a client its connection,
//! 4. transition under the room's lock, dispatch after the guard drops.

use std::sync::Arc;

use crate::fanout::{Dispatcher, Fanout};
use crate::protocol::{self, ClientEvent};
use crate::registry::RoomRegistry;

/// Transport-attributed context for one inbound event.
///
/// The transport has already authenticated the connection; attribution here
/// is trusted, not re-verified.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Room the connection was opened for, if the transport knows it.
    pub room_id: Option<String>,
    pub user_id: String,
    pub connection_id: String,
}

/// Ingress errors surfaced to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressError {
    /// Neither the payload nor the connection identifies a room.
    MissingRoomId,
}

impl std::fmt::Display for IngressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRoomId => write!(f, "roomId required"),
        }
    }
}

impl std::error::Error for IngressError {}

/// Receives attributed events and drives them through the room state machine.
pub struct EventIngress {
    registry: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
}

impl EventIngress {
    pub fn new(registry: Arc<RoomRegistry>, fanout: Arc<dyn Fanout>) -> Self {
        Self {
            registry,
            dispatcher: Dispatcher::new(fanout),
        }
    }

    /// Process one raw inbound payload.
    ///
    /// Returns `Err` only for a structurally invalid request (missing room
    /// identifier). Unparsable or unknown events are swallowed: logged,
    /// acknowledged as success, no state change, no broadcast.
    pub async fn handle_event(&self, ctx: &EventContext, raw: &str) -> Result<(), IngressError> {
        let payload = match protocol::decode_payload(raw) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("discarding unparsable event from {}: {e}", ctx.user_id);
                return Ok(());
            }
        };

        let room_id = protocol::room_id_of(&payload)
            .or_else(|| ctx.room_id.clone())
            .ok_or(IngressError::MissingRoomId)?;

        let event = match protocol::event_of(payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("unhandled event from {} in room {room_id}: {e}", ctx.user_id);
                return Ok(());
            }
        };

        log::debug!(
            "room {room_id}: {event:?} from {} ({})",
            ctx.user_id,
            ctx.connection_id
        );

        self.apply(&room_id, ctx, event).await;
        Ok(())
    }

    /// Apply an already-parsed event. Used by transports that do their own
    /// framing and by tests.
    pub async fn apply(&self, room_id: &str, ctx: &EventContext, event: ClientEvent) {
        let room = self.registry.get_or_create(room_id).await;

        let outbound = {
            let mut room = room.lock().await;
            room.apply(&ctx.user_id, &ctx.connection_id, event)
        };
        // Guard dropped: delivery happens outside the room's critical section.
        self.dispatcher.deliver(room_id, outbound);
    }

    /// The registry this ingress resolves rooms against.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
