use thiserror::Error;

use crate::config::ConfigError;

/// Failure of a single provider call (blocking or streaming).
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("{provider} generation error: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} generation error: HTTP {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} generation error: malformed response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("{provider} streaming error: {message}")]
    Stream { provider: String, message: String },
}

impl GenerationError {
    pub fn transport(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn malformed(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn stream(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::Stream {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Transport { provider, .. }
            | Self::Api { provider, .. }
            | Self::MalformedResponse { provider, .. }
            | Self::Stream { provider, .. } => provider,
        }
    }
}

/// Failure of one search backend. Never leaves `SearchService::search`.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(String),

    #[error("search backend returned HTTP {0}")]
    Status(u16),

    #[error("could not parse search response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SearchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SearchError::Parse(e.to_string())
        } else {
            SearchError::Transport(e.to_string())
        }
    }
}

/// Errors surfaced to the caller of the chat service.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Status code the route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::UnknownProvider(_) | GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Generation(_) => 502,
            GatewayError::Storage(_) | GatewayError::Config(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_error_names_provider() {
        let err = GenerationError::Api {
            provider: "openai".to_string(),
            status: 401,
            body: "invalid key".to_string(),
        };
        assert_eq!(err.to_string(), "openai generation error: HTTP 401: invalid key");
        assert_eq!(err.provider(), "openai");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::NotFound("Session".into()).status_code(), 404);
        assert_eq!(GatewayError::UnknownProvider("x".into()).status_code(), 400);
        let gen = GatewayError::from(GenerationError::transport("gemini", "timeout"));
        assert_eq!(gen.status_code(), 502);
        assert_eq!(gen.to_string(), "gemini generation error: timeout");
    }
}
