//! Connection negotiation: credentials that authorize group subscription.
//!
//! Before opening a realtime connection, a client asks for an access
//! credential scoped to one room. The [`CredentialIssuer`] trait models that
//! collaborator; [`TicketIssuer`] is the in-memory implementation used by the
//! bundled transport. Tickets are opaque, expiring, and bound to a
//! (user, room) pair — they authorize subscribing to the room's group, and
//! nothing more. Identity is still self-declared; this is not authentication.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Default ticket lifetime, matching the hour-scale access tokens of hosted
/// pub/sub services.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(3600);

/// A credential the client can connect with.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedAccess {
    /// Ready-to-use WebSocket URL carrying room, user, and ticket.
    pub url: String,
}

/// Negotiation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiateError {
    /// A required parameter was missing or empty. Rejected request.
    MissingField(&'static str),
    /// The issuer cannot mint credentials right now. Fatal for this request
    /// only; the service keeps running.
    Unavailable(String),
}

impl std::fmt::Display for NegotiateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "{field} is required"),
            Self::Unavailable(e) => write!(f, "credential issuer unavailable: {e}"),
        }
    }
}

impl std::error::Error for NegotiateError {}

/// Issues access credentials authorizing a user to join one room's group.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, user_id: &str, group: &str) -> Result<IssuedAccess, NegotiateError>;
}

struct Grant {
    user_id: String,
    group: String,
    expires_at: Instant,
}

/// In-memory ticket table.
///
/// Tickets are UUIDs; a ticket validates only for the exact (user, group)
/// pair it was issued for and only until it expires. Expired grants are
/// purged lazily on issue. Tickets are multi-use within their lifetime so a
/// page refresh can reconnect without renegotiating.
pub struct TicketIssuer {
    /// Base WebSocket URL of the transport, e.g. `ws://127.0.0.1:9090`.
    public_url: String,
    ttl: Duration,
    grants: Mutex<HashMap<Uuid, Grant>>,
}

impl TicketIssuer {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self::with_ttl(public_url, DEFAULT_TICKET_TTL)
    }

    /// Create with a custom ticket lifetime (short lifetimes in tests).
    pub fn with_ttl(public_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            public_url: public_url.into(),
            ttl,
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// Check a presented ticket against its grant.
    pub fn validate(&self, ticket: &str, user_id: &str, group: &str) -> bool {
        let ticket = match Uuid::parse_str(ticket) {
            Ok(ticket) => ticket,
            Err(_) => return false,
        };

        let grants = match self.grants.lock() {
            Ok(grants) => grants,
            Err(_) => {
                log::error!("ticket table poisoned, refusing {user_id}");
                return false;
            }
        };

        match grants.get(&ticket) {
            Some(grant) => {
                grant.expires_at > Instant::now()
                    && grant.user_id == user_id
                    && grant.group == group
            }
            None => false,
        }
    }

    /// Number of live (possibly expired, not yet purged) grants.
    pub fn grant_count(&self) -> usize {
        self.grants.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl CredentialIssuer for TicketIssuer {
    fn issue(&self, user_id: &str, group: &str) -> Result<IssuedAccess, NegotiateError> {
        if user_id.is_empty() {
            return Err(NegotiateError::MissingField("userId"));
        }
        if group.is_empty() {
            return Err(NegotiateError::MissingField("roomId"));
        }

        let ticket = Uuid::new_v4();
        let now = Instant::now();

        {
            let mut grants = self
                .grants
                .lock()
                .map_err(|e| NegotiateError::Unavailable(e.to_string()))?;
            grants.retain(|_, grant| grant.expires_at > now);
            grants.insert(
                ticket,
                Grant {
                    user_id: user_id.to_string(),
                    group: group.to_string(),
                    expires_at: now + self.ttl,
                },
            );
        }

        log::debug!("issued ticket for {user_id} → group {group}");
        // Room and user ids are short opaque tokens; they are not URL-escaped.
        Ok(IssuedAccess {
            url: format!(
                "{}/?room={group}&user={user_id}&ticket={ticket}",
                self.public_url
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_requires_user_and_room() {
        let issuer = TicketIssuer::new("ws://localhost:9090");
        assert_eq!(
            issuer.issue("", "r1"),
            Err(NegotiateError::MissingField("userId"))
        );
        assert_eq!(
            issuer.issue("u1", ""),
            Err(NegotiateError::MissingField("roomId"))
        );
    }

    #[test]
    fn test_issued_ticket_validates_for_its_grant_only() {
        let issuer = TicketIssuer::new("ws://localhost:9090");
        let access = issuer.issue("u1", "r1").unwrap();

        let ticket = access
            .url
            .rsplit("ticket=")
            .next()
            .unwrap()
            .to_string();

        assert!(issuer.validate(&ticket, "u1", "r1"));
        assert!(!issuer.validate(&ticket, "u2", "r1"));
        assert!(!issuer.validate(&ticket, "u1", "r2"));
        assert!(!issuer.validate("not-a-ticket", "u1", "r1"));
        assert!(!issuer.validate(&Uuid::new_v4().to_string(), "u1", "r1"));
    }

    #[test]
    fn test_url_carries_connection_parameters() {
        let issuer = TicketIssuer::new("ws://poker.example:9090");
        let access = issuer.issue("u1", "r1").unwrap();
        assert!(access.url.starts_with("ws://poker.example:9090/?"));
        assert!(access.url.contains("room=r1"));
        assert!(access.url.contains("user=u1"));
        assert!(access.url.contains("ticket="));
    }

    #[test]
    fn test_expired_ticket_rejected_and_purged() {
        let issuer = TicketIssuer::with_ttl("ws://localhost:9090", Duration::from_secs(0));
        let access = issuer.issue("u1", "r1").unwrap();
        let ticket = access.url.rsplit("ticket=").next().unwrap().to_string();

        assert!(!issuer.validate(&ticket, "u1", "r1"));
        assert_eq!(issuer.grant_count(), 1);

        // The next issue sweeps the expired grant.
        issuer.issue("u2", "r1").unwrap();
        assert_eq!(issuer.grant_count(), 1);
    }

    #[test]
    fn test_tickets_are_multi_use_within_ttl() {
        let issuer = TicketIssuer::new("ws://localhost:9090");
        let access = issuer.issue("u1", "r1").unwrap();
        let ticket = access.url.rsplit("ticket=").next().unwrap().to_string();

        assert!(issuer.validate(&ticket, "u1", "r1"));
        assert!(issuer.validate(&ticket, "u1", "r1"));
    }
}
