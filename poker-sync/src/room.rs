//! Per-room state machine for estimation rounds.
//!
//! A [`Room`] is the single authority for one estimation session. Every
//! inbound event is applied through [`Room::apply`], which mutates the room
//! and returns the messages to deliver — addressed either to one connection
//! (initial state sync) or to the whole room group, optionally excluding one
//! user. The state machine itself never touches the network.
//!
//! Two rules are enforced here and nowhere else:
//!
//! - **Vote secrecy** — no message produced before reveal ever carries a
//!   vote value, and the join snapshot's vote map stays empty until reveal.
//! - **Facilitator authority** — reveal, reset, story, and estimate changes
//!   are accepted only from the user who created the room. Anyone else's
//!   attempt is a silent no-op: no state change, no broadcast, no error.

use std::collections::HashMap;

use crate::protocol::{ClientEvent, Participant, RoomSnapshot, ServerMessage};

/// Where an outbound message should be delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Recipient {
    /// One specific connection.
    Connection(String),
    /// Every connection subscribed to the room group, minus the excluded user.
    Group { exclude: Option<String> },
}

/// A message paired with its delivery target.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub recipient: Recipient,
    pub message: ServerMessage,
}

impl Outbound {
    /// Address a message to a single connection.
    pub fn to_connection(connection_id: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            recipient: Recipient::Connection(connection_id.into()),
            message,
        }
    }

    /// Address a message to the whole room group.
    pub fn to_group(message: ServerMessage) -> Self {
        Self {
            recipient: Recipient::Group { exclude: None },
            message,
        }
    }

    /// Address a message to the room group, excluding one user.
    pub fn to_group_except(user_id: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            recipient: Recipient::Group {
                exclude: Some(user_id.into()),
            },
            message,
        }
    }
}

/// Authoritative state for one estimation room.
///
/// Participants are kept in join order. Vote entries exist only for users
/// who voted in the current round; `votes` keys are always a subset of the
/// participant ids because a vote is refused unless the user has joined.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    room_id: String,
    participants: Vec<Participant>,
    votes: HashMap<String, String>,
    is_revealed: bool,
    facilitator_id: Option<String>,
    story: Option<String>,
    story_url: Option<String>,
    estimate: Option<String>,
}

impl Room {
    /// Create an empty room. The first user to join becomes the facilitator.
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participants: Vec::new(),
            votes: HashMap::new(),
            is_revealed: false,
            facilitator_id: None,
            story: None,
            story_url: None,
            estimate: None,
        }
    }

    /// Apply one event and return the messages to deliver.
    ///
    /// Precondition failures (vote after reveal, privileged event from a
    /// non-facilitator, vote from a non-participant) return an empty vector
    /// and leave the room untouched.
    pub fn apply(
        &mut self,
        user_id: &str,
        connection_id: &str,
        event: ClientEvent,
    ) -> Vec<Outbound> {
        match event {
            ClientEvent::Join { nickname } => self.join(user_id, connection_id, nickname),

            ClientEvent::Vote { value } => {
                if self.is_revealed {
                    log::debug!("room {}: vote from {user_id} after reveal, ignored", self.room_id);
                    return Vec::new();
                }
                let participant = match self.participants.iter_mut().find(|p| p.id == user_id) {
                    Some(p) => p,
                    None => {
                        log::debug!(
                            "room {}: vote from non-participant {user_id}, ignored",
                            self.room_id
                        );
                        return Vec::new();
                    }
                };
                participant.has_voted = true;
                self.votes.insert(user_id.to_string(), value);
                // The vote value is withheld until reveal.
                vec![Outbound::to_group(ServerMessage::Voted {
                    user_id: user_id.to_string(),
                })]
            }

            ClientEvent::Reveal => {
                if !self.is_facilitator(user_id) {
                    return Vec::new();
                }
                self.is_revealed = true;
                vec![Outbound::to_group(ServerMessage::Revealed {
                    votes: self.votes.clone(),
                })]
            }

            ClientEvent::Reset => {
                if !self.is_facilitator(user_id) {
                    return Vec::new();
                }
                self.votes.clear();
                self.is_revealed = false;
                self.story = None;
                self.story_url = None;
                self.estimate = None;
                for participant in &mut self.participants {
                    participant.has_voted = false;
                }
                vec![Outbound::to_group(ServerMessage::Reset)]
            }

            ClientEvent::SetStory { story, story_url } => {
                if !self.is_facilitator(user_id) {
                    return Vec::new();
                }
                self.story = non_empty(story);
                self.story_url = story_url.and_then(non_empty);
                vec![Outbound::to_group(ServerMessage::StoryUpdated {
                    story: self.story.clone(),
                    story_url: self.story_url.clone(),
                })]
            }

            ClientEvent::SetEstimate { estimate } => {
                if !self.is_facilitator(user_id) {
                    return Vec::new();
                }
                self.estimate = non_empty(estimate);
                vec![Outbound::to_group(ServerMessage::EstimateSet {
                    estimate: self.estimate.clone(),
                })]
            }

            // Disconnect handling is an open product question: participants
            // are kept so a page refresh can rejoin with state intact.
            ClientEvent::Leave => Vec::new(),
        }
    }

    fn join(&mut self, user_id: &str, connection_id: &str, nickname: String) -> Vec<Outbound> {
        match self.participants.iter_mut().find(|p| p.id == user_id) {
            Some(existing) => {
                // Rejoin: same entry, fresh nickname and vote flag.
                existing.nickname = nickname.clone();
                existing.has_voted = false;
            }
            None => self.participants.push(Participant {
                id: user_id.to_string(),
                nickname: nickname.clone(),
                has_voted: false,
            }),
        }

        if self.facilitator_id.is_none() {
            self.facilitator_id = Some(user_id.to_string());
            log::info!("room {}: {user_id} claimed facilitator", self.room_id);
        }

        vec![
            // The joiner gets the full snapshot; everyone else a notification.
            Outbound::to_connection(
                connection_id,
                ServerMessage::RoomState {
                    state: self.snapshot(),
                },
            ),
            Outbound::to_group_except(
                user_id,
                ServerMessage::UserJoined {
                    user: Participant {
                        id: user_id.to_string(),
                        nickname,
                        has_voted: false,
                    },
                },
            ),
        ]
    }

    /// Current room state as sent to a joining connection.
    ///
    /// The vote map is disclosed only once the room is revealed.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            participants: self.participants.clone(),
            votes: if self.is_revealed {
                self.votes.clone()
            } else {
                HashMap::new()
            },
            is_revealed: self.is_revealed,
            facilitator_id: self.facilitator_id.clone(),
            story: self.story.clone(),
            story_url: self.story_url.clone(),
            estimate: self.estimate.clone(),
        }
    }

    fn is_facilitator(&self, user_id: &str) -> bool {
        self.facilitator_id.as_deref() == Some(user_id)
    }

    /// The room identifier (doubles as the fan-out group name).
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The facilitator, if anyone has joined yet.
    pub fn facilitator_id(&self) -> Option<&str> {
        self.facilitator_id.as_deref()
    }

    /// Number of participants who ever joined this room.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Whether the current round has been revealed.
    pub fn is_revealed(&self) -> bool {
        self.is_revealed
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
