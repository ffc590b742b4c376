//! Chat protocol types.
//!
//! `WireMessage` is the one bit-exact contract with clients; everything else
//! here is internal.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::{AuthError, Claims, Role};

/// Authenticated participant bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role,
        }
    }
}

/// Subject, name and role are all required; nothing is defaulted.
impl TryFrom<&Claims> for Identity {
    type Error = AuthError;

    fn try_from(claims: &Claims) -> Result<Self, Self::Error> {
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        let name = claims.display_name().ok_or(AuthError::MissingClaim("name"))?;
        let role = claims
            .effective_role()
            .ok_or(AuthError::MissingClaim("role"))?;

        Ok(Self::new(claims.sub.clone(), name, role))
    }
}

/// Chat message as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: String,
    pub message: String,
    pub timestamp: String,
}

impl WireMessage {
    /// Stamp `text` with the sender's identity and the current time.
    pub fn from_sender(sender: &Identity, text: impl Into<String>) -> Self {
        Self::at(sender, text, Utc::now())
    }

    pub fn at(sender: &Identity, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.name.clone(),
            sender_role: sender.role.to_string(),
            message: text.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// A text frame that cannot be turned into a message.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("direct message has an empty recipient")]
    EmptyRecipient,
}

/// Structured inbound frame. Plain text frames carry only a message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    pub message: String,
    /// Recipient for a direct message; broadcast when absent.
    #[serde(default)]
    pub to: Option<String>,
}

impl InboundFrame {
    /// Parse a text frame.
    ///
    /// A JSON object must be a well-formed frame: `message` as a string and,
    /// if present, a non-blank string `to`. Any other text is a broadcast
    /// payload as-is.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => {
                return Ok(InboundFrame {
                    message: text.to_string(),
                    to: None,
                });
            }
        };

        let frame: InboundFrame = serde_json::from_value(value)?;
        if frame.to.as_deref().is_some_and(|to| to.trim().is_empty()) {
            return Err(FrameError::EmptyRecipient);
        }
        Ok(frame)
    }
}

/// One row of the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
}
