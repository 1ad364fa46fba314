use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::otp::OtpSource;
use crate::platform::{ChatPlatform, IncomingMessage};
use crate::usage::Accounting;

/// What happened to a trigger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A code was posted back to the requester
    Sent { code: String },
    /// Arrived outside a direct message; dropped without reply
    NotDirectMessage,
    /// Channel or user ID was empty; dropped without reply
    MissingFields,
}

pub fn reply_text(code: &str) -> String {
    format!("Your TOTP code is: {}", code)
}

/// Answers the trigger phrase with the current code, in private only.
pub struct CommandHandler {
    trigger: String,
    otp: Arc<dyn OtpSource>,
    accounting: Accounting,
}

impl CommandHandler {
    pub fn new(trigger: impl Into<String>, otp: Arc<dyn OtpSource>, accounting: Accounting) -> Self {
        Self {
            trigger: trigger.into(),
            otp,
            accounting,
        }
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Exact, case-sensitive comparison against the trigger phrase
    pub fn matches(&self, text: &str) -> bool {
        text == self.trigger
    }

    /// Handle one trigger message.
    ///
    /// With accounting enabled the sender's username is resolved and their
    /// count bumped before any eligibility check, so filtered messages are
    /// still counted. A failed username lookup aborts the event.
    pub async fn handle(
        &self,
        platform: &dyn ChatPlatform,
        msg: &IncomingMessage,
    ) -> Result<Outcome> {
        let usage = if self.accounting.is_enabled() {
            let username = platform
                .user_name(&msg.user)
                .await
                .with_context(|| format!("Failed to look up user {}", msg.user))?;
            let count = self.accounting.record(&username).await;
            count.map(|count| (username, count))
        } else {
            None
        };

        info!("Received message: {:?}", msg);

        if !msg.is_direct_message() {
            info!("Not a DM. Ignoring message.");
            return Ok(Outcome::NotDirectMessage);
        }

        if msg.channel.is_empty() || msg.user.is_empty() {
            warn!("Missing channel or user information.");
            return Ok(Outcome::MissingFields);
        }

        let code = self.otp.current_code();
        platform
            .send_message(&msg.channel, &reply_text(&code))
            .await
            .with_context(|| format!("Failed to send code to {}", msg.channel))?;

        if let Some((username, count)) = &usage {
            info!(
                "{} has interacted with the bot {} times.",
                username, count
            );
        }
        info!(
            "{} Sent 2FA code to {}",
            chrono::Utc::now().format("%H:%M:%S"),
            msg.user
        );

        Ok(Outcome::Sent { code })
    }
}
