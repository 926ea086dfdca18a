use serde::{Deserialize, Serialize};

/// Name every chat starts with. A chat that still carries it gets renamed
/// after the first prompt it receives.
pub const DEFAULT_CHAT_NAME: &str = "New Chat";

/// Credits debited per text completion.
pub const TEXT_MESSAGE_COST: i64 = 1;

/// Credits debited per image generation.
pub const IMAGE_MESSAGE_COST: i64 = 2;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}
