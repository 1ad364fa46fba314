pub mod slack;

use anyhow::Result;
use async_trait::async_trait;

/// A message event received from the chat platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Platform-specific sender ID
    pub user: String,
    /// Channel the message arrived on
    pub channel: String,
    /// Channel kind, e.g. "im" for a direct message
    pub channel_type: String,
    /// The message text
    pub text: String,
}

impl IncomingMessage {
    pub fn is_direct_message(&self) -> bool {
        self.channel_type == "im"
    }
}

/// Outbound calls the command handler makes back into the platform
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post `text` into `channel`
    async fn send_message(&self, channel: &str, text: &str) -> Result<()>;

    /// Look up the username for a user ID
    async fn user_name(&self, user_id: &str) -> Result<String>;
}
