use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::types::{ChatId, UpdateId};

/// A relay user, keyed by chat id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub chat_id: ChatId,
    pub approved: bool,
    pub username: String,
    pub full_name: String,
    /// Key-derivation input for this user's transcript. Never changes once set.
    pub salt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub input_state: InputState,
    pub invite_code: Option<String>,
    pub invited_by: Option<ChatId>,
    pub invited_with: Option<String>,
    pub dialog_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a user seen for the first time.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub chat_id: ChatId,
    pub username: String,
    pub full_name: String,
}

/// What the next plain-text message from the user means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputState {
    #[default]
    Empty,
    AwaitingSystemPrompt,
}

impl InputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputState::Empty => "empty",
            InputState::AwaitingSystemPrompt => "awaiting_system_prompt",
        }
    }
}

impl FromStr for InputState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "empty" => Ok(InputState::Empty),
            "awaiting_system_prompt" => Ok(InputState::AwaitingSystemPrompt),
            other => Err(Error::Database(format!("unknown input state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::Database(format!("unknown message role '{other}'"))),
        }
    }
}

/// Storage format of an encrypted message body.
///
/// Writes always use [`MessageVersion::CURRENT`]; readers must handle every
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageVersion {
    /// Reversible obfuscation, predates encryption.
    Obscured,
    /// AES-256-GCM with a single-hash key derivation.
    LegacyAes,
    /// AES-256-GCM with a PBKDF2 key derivation.
    Aes,
}

impl MessageVersion {
    pub const CURRENT: MessageVersion = MessageVersion::Aes;

    pub fn tag(&self) -> i64 {
        match self {
            MessageVersion::Obscured => 0,
            MessageVersion::LegacyAes => 1,
            MessageVersion::Aes => 2,
        }
    }
}

impl TryFrom<i64> for MessageVersion {
    type Error = Error;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageVersion::Obscured),
            1 => Ok(MessageVersion::LegacyAes),
            2 => Ok(MessageVersion::Aes),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }
}

/// A message row as read back from the store. `body` is still sealed.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: ChatId,
    pub role: Role,
    pub body: String,
    /// Raw version tag; decoded by the cryptor so unknown tags surface there.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// A sealed message ready to be written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub role: Role,
    pub body: String,
    pub version: MessageVersion,
    pub created_at: DateTime<Utc>,
}

/// Token accounting for one completed turn.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub chat_id: ChatId,
    pub update_id: UpdateId,
    pub dialog_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags_are_stable() {
        for version in [
            MessageVersion::Obscured,
            MessageVersion::LegacyAes,
            MessageVersion::Aes,
        ] {
            assert_eq!(MessageVersion::try_from(version.tag()).unwrap(), version);
        }
        assert_eq!(MessageVersion::CURRENT.tag(), 2);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = MessageVersion::try_from(9).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(9)));
    }

    #[test]
    fn role_and_input_state_parse() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
        assert_eq!(
            "awaiting_system_prompt".parse::<InputState>().unwrap(),
            InputState::AwaitingSystemPrompt
        );
        assert_eq!("".parse::<InputState>().unwrap(), InputState::Empty);
    }
}
