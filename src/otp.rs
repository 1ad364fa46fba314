use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use totp_rs::{Algorithm, Secret, TOTP};

/// Source of the code that is currently valid for the bot's shared secret.
pub trait OtpSource: Send + Sync {
    fn current_code(&self) -> String;
}

/// Time-based one-time password bound to a single pre-provisioned secret
/// (RFC 6238 with HMAC-SHA1).
#[derive(Clone)]
pub struct Totp {
    inner: TOTP,
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp")
            .field("digits", &self.inner.digits)
            .field("period", &self.inner.step)
            .finish_non_exhaustive()
    }
}

impl Totp {
    /// Decode an RFC 4648 base32 secret. Lowercase letters, spaces and
    /// trailing `=` padding are accepted.
    ///
    /// Secrets shorter than the 128 bits RFC 4226 recommends are still
    /// accepted, as authenticator apps accept them.
    pub fn new(secret: &str, digits: u32, period: u64) -> Result<Self> {
        let normalized: String = secret
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.is_empty() {
            anyhow::bail!("TOTP secret is empty");
        }

        let key = Secret::Encoded(normalized)
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("{:?}", e))
            .context("TOTP secret is not valid base32")?;

        Ok(Self {
            inner: TOTP::new_unchecked(Algorithm::SHA1, digits as usize, 1, period, key),
        })
    }

    /// Code for the time step containing `seconds_since_epoch`, zero-padded.
    pub fn generate(&self, seconds_since_epoch: u64) -> String {
        self.inner.generate(seconds_since_epoch)
    }
}

impl OtpSource for Totp {
    fn current_code(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.generate(now)
    }
}
