//! # poker-sync — room synchronization for real-time planning poker
//!
//! One participant hosts an estimation room, others join via a shared link,
//! everyone picks a card in private, and the facilitator reveals all
//! selections at once. This crate is the authoritative synchronization
//! service behind that: per-room state machines fed by a validating ingress,
//! with deltas fanned out to exactly the right audience.
//!
//! ## Architecture
//!
//! ```text
//! client event ──► EventIngress ──► RoomRegistry ──► Room::apply
//!                       │            (get_or_create)      │
//!                       │                            Outbound[]
//!                       ▼                                 │
//!                  Dispatcher ◄───────────────────────────┘
//!                       │
//!                       ▼
//!                    Fanout ──► one connection (state snapshot)
//!                           ──► room group, minus excluded user
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire types with fail-soft, double-decode-tolerant parsing
//! - [`room`] — per-room state machine (vote secrecy, facilitator authority)
//! - [`registry`] — concurrency-safe room lookup/creation, one lock per room
//! - [`fanout`] — the pub/sub seam and its in-process implementation
//! - [`ingress`] — event validation, room resolution, transition dispatch
//! - [`negotiate`] — access credentials scoped to one room's group
//! - [`server`] — WebSocket transport
//! - [`client`] — typed client for tests and demos

pub mod client;
pub mod fanout;
pub mod ingress;
pub mod negotiate;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use client::RoomClient;
pub use fanout::{Dispatcher, Fanout, FanoutStats, GroupFrame, LocalFanout};
pub use ingress::{EventContext, EventIngress, IngressError};
pub use negotiate::{CredentialIssuer, IssuedAccess, NegotiateError, TicketIssuer};
pub use protocol::{ClientEvent, Participant, ProtocolError, RoomSnapshot, ServerMessage};
pub use registry::RoomRegistry;
pub use room::{Outbound, Recipient, Room};
pub use server::{RoomServer, ServerConfig, ServerStats};
