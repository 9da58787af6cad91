//! # strand-llm
//!
//! Model provider contract for the Strand engine.
//!
//! - **[`provider::ModelProvider`]**: the trait a concrete inference
//!   backend implements — `generate` returns an ordered stream of text
//!   fragments plus a terminal done/error event.
//! - **[`mock::MockProvider`]**: a scripted provider for tests, with
//!   configurable chunk boundaries.
//!
//! ## Crate Position
//!
//! Leaf contract crate. Depended on by: strand-runtime.

#![deny(unsafe_code)]

pub mod mock;
pub mod provider;

pub use mock::{MockProvider, MockResponse};
pub use provider::{GenerateRequest, ModelProvider, ModelStream, ProviderError, StreamEvent};
