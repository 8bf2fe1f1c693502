use std::fmt;

use glam::Vec2;

/// Identifier used by the relay for the messages it originates.
pub const SERVER_IDENTIFIER: &str = "server";

pub type Position = Vec2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIdentifier {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier contains a control character at byte {0}")]
    ControlCharacter(usize),
    #[error("identifier `{0}` is reserved")]
    Reserved(String),
}

/// Player identifier chosen by the client. Unique among connected sessions.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[rkyv(derive(Debug))]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let id = Self(value.into());
        id.validate()?;
        Ok(id)
    }

    pub fn server() -> Self {
        Self(SERVER_IDENTIFIER.to_string())
    }

    pub fn validate(&self) -> Result<(), InvalidIdentifier> {
        if self.0.is_empty() {
            return Err(InvalidIdentifier::Empty);
        }
        if let Some((index, _)) = self.0.char_indices().find(|(_, c)| c.is_control()) {
            return Err(InvalidIdentifier::ControlCharacter(index));
        }
        Ok(())
    }

    /// Validation for identifiers a client wants to register.
    pub fn validate_client(&self) -> Result<(), InvalidIdentifier> {
        self.validate()?;
        if self.is_server() {
            return Err(InvalidIdentifier::Reserved(self.0.clone()));
        }
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        self.0 == SERVER_IDENTIFIER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for EntityId {
    type Error = InvalidIdentifier;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(EntityId::new("player-1").is_ok());
        assert!(EntityId::new("with spaces and ünïcödé").is_ok());
        assert!(EntityId::new("x".repeat(500)).is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert_eq!(EntityId::new(""), Err(InvalidIdentifier::Empty));
        assert_eq!(
            EntityId::new("bad\nname"),
            Err(InvalidIdentifier::ControlCharacter(3))
        );
    }

    #[test]
    fn test_server_identifier_reserved_for_clients() {
        let server = EntityId::server();
        assert!(server.validate().is_ok());
        assert!(matches!(
            server.validate_client(),
            Err(InvalidIdentifier::Reserved(_))
        ));
    }
}
