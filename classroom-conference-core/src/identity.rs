//! Participant and room identity
//!
//! Identifiers are opaque strings chosen by the surrounding application. The
//! only structure the conferencing core relies on is their byte-wise ordering,
//! which decides which side of a pair sends the offer.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Opaque identifier of a participant in a room
///
/// Ordering is plain lexicographic byte order of the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this participant sends the offer when paired with `remote`
    ///
    /// The participant with the lexicographically smaller id initiates. Two
    /// equal ids never form a pair.
    #[must_use]
    pub fn initiates_with(&self, remote: &ParticipantId) -> bool {
        self < remote
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier of a classroom
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a new room identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role of a participant in the classroom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Teacher leading the session
    Teacher,
    /// Student attending the session
    #[default]
    Student,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Teacher => f.write_str("teacher"),
            Self::Student => f.write_str("student"),
        }
    }
}

/// Identity announced by a participant when joining a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Participant identifier
    pub id: ParticipantId,
    /// Name shown to other participants
    pub display_name: String,
    /// Classroom role
    pub role: Role,
}

impl ParticipantInfo {
    /// Create participant info
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    /// Info for a participant only known from a peer-to-peer message so far
    ///
    /// Display name falls back to the id until a presence notice arrives.
    #[must_use]
    pub fn placeholder(id: ParticipantId) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            role: Role::Student,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_ordering_decides_initiator() {
        let alice = ParticipantId::new("alice");
        let bob = ParticipantId::new("bob");

        assert!(alice.initiates_with(&bob));
        assert!(!bob.initiates_with(&alice));
        assert!(!alice.initiates_with(&alice.clone()));
    }

    #[test]
    fn test_ordering_is_bytewise() {
        // Uppercase sorts before lowercase in byte order
        let upper = ParticipantId::new("Zed");
        let lower = ParticipantId::new("amy");
        assert!(upper.initiates_with(&lower));
    }

    #[test]
    fn test_placeholder_info() {
        let info = ParticipantInfo::placeholder(ParticipantId::new("p-42"));
        assert_eq!(info.display_name, "p-42");
        assert_eq!(info.role, Role::Student);
    }

    #[test]
    fn test_participant_info_serialization() {
        let info = ParticipantInfo::new("t1", "Ms. Rivera", Role::Teacher);
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"id":"t1","displayName":"Ms. Rivera","role":"teacher"}"#
        );
        let back: ParticipantInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
