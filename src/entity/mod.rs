use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;


/// Identity of a managed entity in the application tree
///
/// Producers are compared by identity, never by the values they carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a new time-ordered entity id (UUIDv7)
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Parse an entity id supplied from outside (config, membership events)
    ///
    /// Rules:
    /// - must not be empty
    /// - must not contain whitespace
    /// - at most 128 characters
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        if raw.len() > 128 {
            return Err(ParseError::TooLong(raw.len()));
        }
        if let Some(c) = raw.chars().find(|c| c.is_whitespace()) {
            return Err(ParseError::InvalidCharacter(c));
        }
        Ok(Self(raw.to_string()))
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

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Entity ID parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Empty entity ID
    Empty,
    /// Longer than the 128 character limit
    TooLong(usize),
    /// Whitespace is not allowed anywhere in an id
    InvalidCharacter(char),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "entity id cannot be empty"),
            ParseError::TooLong(len) => {
                write!(f, "entity id is {} characters, maximum is 128", len)
            }
            ParseError::InvalidCharacter(c) => {
                write!(f, "invalid character {:?} in entity id", c)
            }
        }
    }
}

impl std::error::Error for ParseError {}
