//! Channel provider abstraction and channel-name routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ChannelError;

/// Summary of a successful send, stored in the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSummary {
    /// Provider-side message id, when the provider returns one.
    pub provider_ref: Option<String>,
    /// Short status string such as `sent` or `queued`.
    pub status: String,
}

impl SendSummary {
    /// Summary with a status and no provider reference.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            provider_ref: None,
            status: status.into(),
        }
    }

    /// Attach the provider's message id.
    #[must_use]
    pub fn with_provider_ref(mut self, provider_ref: impl Into<String>) -> Self {
        self.provider_ref = Some(provider_ref.into());
        self
    }
}

/// Adapter for one external notification provider.
///
/// Implementations classify every failure as [`ChannelError::Transient`] or
/// [`ChannelError::PermanentValidation`]. They should be cancel-safe: a send
/// aborted at the hard time limit is treated as a transient failure.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_dispatch::core::{ChannelError, ChannelProvider, SendSummary};
///
/// struct SmtpChannel;
///
/// #[async_trait]
/// impl ChannelProvider for SmtpChannel {
///     fn channel(&self) -> &str {
///         "email"
///     }
///
///     async fn send(&self, recipient: &str, message: &str) -> Result<SendSummary, ChannelError> {
///         // talk to the SMTP relay...
///         Ok(SendSummary::new("sent"))
///     }
/// }
/// ```
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Channel name this provider serves.
    fn channel(&self) -> &str;

    /// Circuit-breaker service name; one breaker per provider.
    fn service_name(&self) -> String {
        format!("{}-provider", self.channel())
    }

    /// Deliver `message` to `recipient`.
    async fn send(&self, recipient: &str, message: &str) -> Result<SendSummary, ChannelError>;
}

/// Maps channel names to providers.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    providers: HashMap<String, Arc<dyn ChannelProvider>>,
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("channels", &self.channels())
            .finish()
    }
}

impl ChannelRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Register a provider under its channel name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) {
        self.providers.insert(provider.channel().to_string(), provider);
    }

    /// Provider for a channel.
    ///
    /// # Errors
    ///
    /// An unknown channel is a [`ChannelError::PermanentValidation`].
    pub fn resolve(&self, channel: &str) -> Result<Arc<dyn ChannelProvider>, ChannelError> {
        self.providers
            .get(channel)
            .cloned()
            .ok_or_else(|| ChannelError::PermanentValidation(format!("unknown channel: {channel}")))
    }

    /// Registered channel names, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
