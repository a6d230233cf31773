//! Error types for Canopy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical provider error kind.
///
/// Every vendor-specific failure surfaced by an adapter is mapped onto this
/// closed set before it reaches the loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    Auth,
    InvalidRequest,
    ServerError,
    Network,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::ServerError => "server_error",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

/// Primary error type for all Canopy operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
        /// Server-requested retry delay, when the vendor supplied one.
        retry_after_ms: Option<u64>,
    },

    #[error("Tool '{tool_name}' failed: {message}")]
    Tool { tool_name: String, message: String },

    #[error("Canceled")]
    Canceled,

    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanopyError {
    /// Create a provider error with a canonical kind.
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Create a rate-limit error carrying the server-requested delay.
    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::RateLimit,
            message: message.into(),
            retry_after_ms,
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Wrap a session-storage failure. Persistence errors are fatal to the
    /// run that encounters them.
    pub fn persistence(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The canonical provider kind of this error, if it has one.
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(*kind),
            Self::Transport(_) => Some(ProviderErrorKind::Network),
            _ => None,
        }
    }

    /// Whether this error is potentially retryable.
    ///
    /// Only transport/provider failures qualify, and only the adapter's own
    /// retry policy may act on this — the loop never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.provider_kind(),
            Some(
                ProviderErrorKind::RateLimit
                    | ProviderErrorKind::ServerError
                    | ProviderErrorKind::Network
            )
        )
    }

    /// Whether this error must terminate the run immediately rather than be
    /// folded into the conversation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, CanopyError>;
