//! Persistence facades — the semantic message store, the project/thread
//! lookup store, and the TTL'd key-value substrate backing the streaming
//! fabric and the status registry.
//!
//! All three are traits with in-process implementations; network-backed
//! implementations plug in behind the same contracts.

pub mod jsonl;
pub mod kv;
pub mod messages;
pub mod projects;

pub use jsonl::JsonlMessageStore;
pub use kv::KvStore;
pub use messages::{InMemoryMessageStore, MessageStore};
pub use projects::{InMemoryProjectStore, ProjectStore};
