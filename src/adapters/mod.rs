//! Provider adapters and the registry that maps a provider identifier to one.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openrouter;
pub mod search;
pub mod sse;
pub mod tools;

use crate::config::{ProviderConfig, StreamingConfig};
use crate::domain::ports::ProviderAdapter;
use crate::error::GatewayError;
use std::fmt;
use std::str::FromStr;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAIAdapter;
pub use openrouter::OpenRouterAdapter;

/// The closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Gemini,
    OpenRouter,
    Anthropic,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Gemini,
        Provider::OpenRouter,
        Provider::Anthropic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::OpenRouter => "openrouter",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Case-insensitive lookup by identifier.
    pub fn parse(name: &str) -> Option<Provider> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name))
    }

    /// Conventional environment variable holding this provider's key.
    pub fn env_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::parse(s).ok_or_else(|| GatewayError::UnknownProvider(s.to_string()))
    }
}

/// Builds an adapter with default endpoints for `provider`.
pub fn get_adapter(provider: &str, api_key: &str) -> Result<Box<dyn ProviderAdapter>, GatewayError> {
    let provider: Provider = provider.parse()?;
    Ok(build_adapter(
        provider,
        api_key,
        &ProviderConfig::default(),
        &StreamingConfig::default(),
    ))
}

/// Applies the optional base URL and timeout every adapter builder accepts.
macro_rules! configured {
    ($adapter:expr, $settings:expr) => {{
        let mut adapter = $adapter;
        if let Some(url) = &$settings.base_url {
            adapter = adapter.with_base_url(url.as_str());
        }
        if let Some(timeout) = $settings.timeout() {
            adapter = adapter.with_timeout(timeout);
        }
        Box::new(adapter) as Box<dyn ProviderAdapter>
    }};
}

/// Builds an adapter, applying configured base URL, timeout and chunk pacing.
pub fn build_adapter(
    provider: Provider,
    api_key: &str,
    settings: &ProviderConfig,
    streaming: &StreamingConfig,
) -> Box<dyn ProviderAdapter> {
    let key = api_key.to_string();
    match provider {
        Provider::OpenAi => configured!(OpenAIAdapter::new(key), settings),
        Provider::Gemini => configured!(GeminiAdapter::new(key), settings),
        Provider::OpenRouter => configured!(OpenRouterAdapter::new(key), settings),
        Provider::Anthropic => configured!(
            AnthropicAdapter::new(key).with_chunker(streaming.chunker()),
            settings
        ),
    }
}
