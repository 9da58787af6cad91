//! Scripted mock provider for tests.
//!
//! Responses are queued ahead of time and replayed in order, one per
//! `generate` call. Chunking is configurable so runtime tests can exercise
//! arbitrary fragment boundaries — including one character at a time.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::provider::{
    GenerateRequest, ModelProvider, ModelStream, ProviderError, StreamEvent,
};

/// How a scripted response is split into `TextDelta` fragments.
#[derive(Clone, Debug)]
pub enum Chunking {
    /// Deliver the whole response as one fragment.
    Whole,
    /// Fixed-size fragments of `n` characters.
    Chars(usize),
    /// Explicit fragment list (must concatenate to the response text).
    Exact(Vec<String>),
}

/// One scripted response.
#[derive(Clone, Debug)]
pub struct MockResponse {
    text: String,
    chunking: Chunking,
    fail_with: Option<String>,
}

impl MockResponse {
    /// A response delivered as a single fragment.
    #[must_use]
    pub fn whole(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chunking: Chunking::Whole,
            fail_with: None,
        }
    }

    /// A response split into fragments of `n` characters.
    #[must_use]
    pub fn chars(text: impl Into<String>, n: usize) -> Self {
        Self {
            text: text.into(),
            chunking: Chunking::Chars(n.max(1)),
            fail_with: None,
        }
    }

    /// A response replayed with the given exact fragment boundaries.
    #[must_use]
    pub fn exact(fragments: Vec<String>) -> Self {
        Self {
            text: fragments.concat(),
            chunking: Chunking::Exact(fragments),
            fail_with: None,
        }
    }

    /// A stream that yields its fragments and then fails terminally.
    #[must_use]
    pub fn failing(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chunking: Chunking::Whole,
            fail_with: Some(error.into()),
        }
    }

    fn fragments(&self) -> Vec<String> {
        match &self.chunking {
            Chunking::Whole => {
                if self.text.is_empty() {
                    vec![]
                } else {
                    vec![self.text.clone()]
                }
            }
            Chunking::Chars(n) => {
                let chars: Vec<char> = self.text.chars().collect();
                chars.chunks(*n).map(|c| c.iter().collect()).collect()
            }
            Chunking::Exact(frags) => frags.clone(),
        }
    }
}

/// Scripted [`ModelProvider`]. Panics in `generate` only if the script is
/// exhausted, which is a test authoring error.
pub struct MockProvider {
    script: Arc<Mutex<Vec<MockResponse>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    /// Provider that replays `responses` in order.
    #[must_use]
    pub fn new(responses: Vec<MockResponse>) -> Self {
        let mut script = responses;
        script.reverse(); // pop() from the back replays in push order
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of `generate` calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<ModelStream, ProviderError> {
        self.calls.lock().push(request.prompt.clone());
        let Some(response) = self.script.lock().pop() else {
            return Err(ProviderError::Request("mock script exhausted".into()));
        };
        debug!(chunks = ?response.chunking, "mock generate");

        let fragments = response.fragments();
        let text = response.text.clone();
        let fail_with = response.fail_with.clone();
        let cancel = request.cancel;

        let stream = async_stream::stream! {
            for fragment in fragments {
                if cancel.is_cancelled() {
                    yield StreamEvent::Error { error: "cancelled".into() };
                    return;
                }
                yield StreamEvent::TextDelta { delta: fragment };
            }
            match fail_with {
                Some(error) => yield StreamEvent::Error { error },
                None => yield StreamEvent::Done {
                    text,
                    stop_reason: "end_turn".into(),
                },
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(mut stream: ModelStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(e) = stream.next().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn whole_response_single_fragment() {
        let provider = MockProvider::new(vec![MockResponse::whole("hello")]);
        let stream = provider
            .generate(GenerateRequest::new("p"))
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StreamEvent::TextDelta {
                delta: "hello".into()
            }
        );
        let StreamEvent::Done { text, .. } = &events[1] else {
            panic!("expected done");
        };
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn char_chunking_covers_text() {
        let provider = MockProvider::new(vec![MockResponse::chars("abcdef", 1)]);
        let stream = provider
            .generate(GenerateRequest::new("p"))
            .await
            .unwrap();
        let events = collect(stream).await;
        // 6 single-char deltas + done
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn responses_replay_in_order() {
        let provider = MockProvider::new(vec![
            MockResponse::whole("first"),
            MockResponse::whole("second"),
        ]);
        let e1 = collect(provider.generate(GenerateRequest::new("a")).await.unwrap()).await;
        let e2 = collect(provider.generate(GenerateRequest::new("b")).await.unwrap()).await;
        assert_eq!(
            e1[0],
            StreamEvent::TextDelta {
                delta: "first".into()
            }
        );
        assert_eq!(
            e2[0],
            StreamEvent::TextDelta {
                delta: "second".into()
            }
        );
        assert_eq!(provider.prompts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failing_response_ends_with_error() {
        let provider = MockProvider::new(vec![MockResponse::failing("partial", "overloaded")]);
        let stream = provider
            .generate(GenerateRequest::new("p"))
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Error {
                error: "overloaded".into()
            }
        );
    }

    #[tokio::test]
    async fn exhausted_script_is_request_error() {
        let provider = MockProvider::new(vec![]);
        let err = provider.generate(GenerateRequest::new("p")).await;
        assert!(err.is_err());
    }
}
