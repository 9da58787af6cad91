//! Provider contract — streaming text generation.
//!
//! A provider turns a rendered prompt into an ordered stream of
//! [`StreamEvent`]s. The stream always terminates with exactly one
//! [`StreamEvent::Done`] (carrying the full accumulated text) or one
//! [`StreamEvent::Error`]. Cancellation is cooperative: providers should
//! observe the request's token and end the stream early.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Events yielded while a model response streams in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text content. Fragment boundaries carry no meaning.
    TextDelta {
        /// Text fragment.
        delta: String,
    },
    /// Stream completed successfully.
    Done {
        /// Full accumulated response text.
        text: String,
        /// Provider stop reason (`end_turn`, `max_tokens`, ...).
        stop_reason: String,
    },
    /// Terminal stream failure.
    Error {
        /// Error description.
        error: String,
    },
}

/// A boxed ordered stream of [`StreamEvent`]s.
pub type ModelStream = BoxStream<'static, StreamEvent>;

/// One generation request.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    /// Rendered prompt text.
    pub prompt: String,
    /// Model override from conversation settings, if any.
    pub model: Option<String>,
    /// Run-level abort signal.
    pub cancel: CancellationToken,
}

impl GenerateRequest {
    /// A request with no model override and a fresh token.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Errors raised before a stream could be established.
///
/// Failures after streaming has begun are delivered in-band as
/// [`StreamEvent::Error`].
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend rejected the request.
    #[error("provider request failed: {0}")]
    Request(String),

    /// The requested model is not served by this provider.
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// A text-generation backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, for logging and events.
    fn name(&self) -> &str;

    /// Start a generation, returning the response stream.
    async fn generate(&self, request: GenerateRequest) -> Result<ModelStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_serde() {
        let e = StreamEvent::TextDelta {
            delta: "hi".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"type":"text_delta","delta":"hi"}"#);
    }

    #[test]
    fn request_defaults() {
        let req = GenerateRequest::new("prompt");
        assert!(req.model.is_none());
        assert!(!req.cancel.is_cancelled());
    }
}
