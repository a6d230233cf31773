//! Provider adapter contract and canonical stream normalization.
//!
//! A vendor integration implements [`ProviderAdapter`]: one call to
//! [`ProviderAdapter::start_stream`] opens one vendor-side stream and yields
//! the canonical [`StreamEvent`] sequence. The loop never sees vendor wire
//! formats; heterogeneous APIs all look identical behind this trait.

pub mod accumulator;
pub mod http;

pub use accumulator::MessageAccumulator;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::CanopyConfig;
use crate::error::{CanopyError, ProviderErrorKind, Result};
use crate::types::{AgentMessage, ModelConfig, StopReason, Usage};

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Generation settings forwarded to the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// A request sent to a provider adapter.
///
/// `api_key` is filled by the loop from the credential resolver immediately
/// before the call; adapters must not cache it.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: ModelConfig,
    pub system_prompt: Option<String>,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<ToolDefinition>,
    pub settings: GenerationSettings,
    pub api_key: Option<String>,
    /// Session id for provider-side prompt caching, when supported.
    pub session_id: Option<String>,
}

/// Canonical representation of a provider streaming delta.
///
/// Deltas for one content index arrive in order; different content indices
/// may interleave arbitrarily (parallel tool-call argument streaming).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// The vendor accepted the request and began a message.
    MessageStart,
    TextStart {
        content_index: usize,
    },
    TextDelta {
        content_index: usize,
        delta: String,
    },
    TextEnd {
        content_index: usize,
    },
    ThinkingStart {
        content_index: usize,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
    },
    ThinkingEnd {
        content_index: usize,
    },
    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
    },
    /// A raw JSON fragment of the call's argument payload.
    ToolCallDelta {
        content_index: usize,
        delta: String,
    },
    ToolCallEnd {
        content_index: usize,
    },
    Usage {
        usage: Usage,
    },
    /// Terminal: the message completed. `reason: aborted` is the
    /// cancellation marker.
    Done {
        reason: StopReason,
    },
    /// Terminal: the vendor reported an error, mapped to a canonical kind.
    Error {
        kind: ProviderErrorKind,
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Finite, non-restartable canonical event stream.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// One vendor streaming API behind the canonical contract.
///
/// Implementations must: preserve per-content-index delta ordering, map
/// vendor errors to [`ProviderErrorKind`], and honor the cancellation token
/// by closing the transport promptly and yielding `Done { reason: aborted }`
/// rather than hanging. Retry (bounded attempts, backoff) is the adapter's
/// own responsibility — see [`crate::util::retry::RetryPolicy`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name this adapter serves (e.g. "anthropic").
    fn provider_name(&self) -> &str;

    /// Open one vendor-side stream for the request.
    async fn start_stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream>;
}

/// Async callback resolving a possibly short-lived API key for a provider.
///
/// Invoked once per adapter call, never cached. This replaces any ambient
/// global credential lookup.
pub type CredentialResolver = Arc<
    dyn Fn(&str) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send>> + Send + Sync,
>;

/// Build a resolver that reads keys from a [`CanopyConfig`].
pub fn config_credential_resolver(config: CanopyConfig) -> CredentialResolver {
    Arc::new(move |provider: &str| {
        let key = config.get_api_key(provider);
        Box::pin(async move { Ok(key) })
    })
}

/// Registry of provider adapters keyed by provider name.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its provider name. The last registration
    /// for a name wins.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_name().to_string(), adapter);
    }

    /// Look up the adapter for a provider.
    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned().ok_or_else(|| {
            CanopyError::Configuration(format!("no adapter registered for provider '{provider}'"))
        })
    }

    /// Registered provider names.
    pub fn providers(&self) -> Vec<&str> {
        self.adapters.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    struct NullAdapter;

    #[async_trait]
    impl ProviderAdapter for NullAdapter {
        fn provider_name(&self) -> &str {
            "null"
        }

        async fn start_stream(
            &self,
            _request: ProviderRequest,
            _cancel: CancellationToken,
        ) -> Result<EventStream> {
            Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::Done {
                reason: StopReason::Stop,
            })])))
        }
    }

    #[test]
    fn registry_resolves_by_provider_name() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter));
        assert!(registry.get("null").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(CanopyError::Configuration(_))
        ));
    }

    #[test]
    fn stream_events_use_snake_case_type_tags() {
        let event = StreamEvent::ToolCallStart {
            content_index: 2,
            id: "call-1".into(),
            name: "bash".into(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "tool_call_start");
        assert_eq!(value["contentIndex"], 2);
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(StreamEvent::Done {
            reason: StopReason::Stop
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            kind: ProviderErrorKind::ServerError,
            message: "boom".into()
        }
        .is_terminal());
        assert!(!StreamEvent::MessageStart.is_terminal());
    }

    #[tokio::test]
    async fn config_resolver_reads_keys_per_call() {
        let config = CanopyConfig::new();
        config.set_api_key("anthropic", "sk-1");
        let resolver = config_credential_resolver(config.clone());

        assert_eq!(
            resolver("anthropic").await.expect("resolve"),
            Some("sk-1".to_string())
        );

        // Key rotation is visible on the next call; nothing is cached.
        config.set_api_key("anthropic", "sk-2");
        assert_eq!(
            resolver("anthropic").await.expect("resolve"),
            Some("sk-2".to_string())
        );
    }
}
