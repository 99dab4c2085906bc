//! Credential record and the provider → environment variable table.

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// A provider identifier plus an opaque token.
///
/// This is also the JSON body of a secret envelope. It lives only in memory
/// on both sides of the channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Credential {
    pub fn new(provider: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            token: token.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Both `provider` and `token` must be non-empty.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.provider.trim().is_empty() {
            return Err(ChannelError::CredentialInvalid("provider"));
        }
        if self.token.is_empty() {
            return Err(ChannelError::CredentialInvalid("token"));
        }
        Ok(())
    }

    /// Provider in the canonical lowercase form used for table lookups.
    pub fn provider_key(&self) -> String {
        self.provider.trim().to_ascii_lowercase()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("token", &"[REDACTED]")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Immutable mapping from provider name to the environment variable that
/// carries its token.
///
/// Passed explicitly to everything that needs it (bootstrap, keystore
/// validation) instead of living in global mutable state.
#[derive(Debug, Clone, Copy)]
pub struct ProviderTable {
    entries: &'static [(&'static str, &'static str)],
}

const STANDARD_PROVIDERS: &[(&str, &str)] = &[
    ("openai", "OPENAI_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
    ("google", "GOOGLE_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("xai", "XAI_API_KEY"),
    ("slack", "SLACK_BOT_TOKEN"),
    ("discord", "DISCORD_BOT_TOKEN"),
    ("teams", "MICROSOFT_API_KEY"),
    ("whatsapp", "WHATSAPP_API_KEY"),
];

impl ProviderTable {
    /// The table shipped with ArmorClaw.
    pub const fn standard() -> Self {
        Self {
            entries: STANDARD_PROVIDERS,
        }
    }

    /// Look up the environment variable for a provider (case-insensitive).
    pub fn env_var(&self, provider: &str) -> Option<&'static str> {
        let provider = provider.trim();
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider))
            .map(|(_, var)| *var)
    }

    pub fn is_known(&self, provider: &str) -> bool {
        self.env_var(provider).is_some()
    }

    /// Every environment variable the table can produce.
    pub fn env_vars(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(_, var)| *var)
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::standard()
    }
}
