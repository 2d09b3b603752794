//! LLM provider implementations. Currently Anthropic only; the trait lives
//! in the agent crate (defined by the consumer, implemented here).

pub mod claude;

pub use claude::ClaudeProvider;
