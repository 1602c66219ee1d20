//! LLM client abstraction and the OpenAI-compatible HTTP adapter.
//!
//! The core never talks to a model directly; it goes through
//! [`LlmClient`], which returns either a full response or an async stream
//! of [`relay_domain::stream::LlmEvent`]s.

pub mod client;
pub mod openai;

pub use client::{ChatRequest, ChatResponse, LlmClient, ReasoningEffort, ToolChoice};
pub use openai::OpenAiClient;
