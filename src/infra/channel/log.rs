//! Channel provider that only logs, for local runs without provider credentials.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::core::{ChannelError, ChannelProvider, SendSummary};

/// Accepts every notification and logs its length, never its content.
#[derive(Debug, Clone)]
pub struct LoggingChannel {
    channel: String,
}

impl LoggingChannel {
    /// Logging provider for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChannelProvider for LoggingChannel {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, _recipient: &str, message: &str) -> Result<SendSummary, ChannelError> {
        let provider_ref = Uuid::new_v4().to_string();
        info!(
            channel = %self.channel,
            provider_ref = %provider_ref,
            message_len = message.len(),
            "notification logged"
        );
        Ok(SendSummary::new("logged").with_provider_ref(provider_ref))
    }
}
