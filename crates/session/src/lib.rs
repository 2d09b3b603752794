//! Session metadata and the append-only message log.
//!
//! One directory per session under the data dir holds the uploaded file, the
//! session metadata and the message log. The message log is the only chat
//! state in the system — the LLM context is rebuilt from it every turn.

pub mod message;
pub mod store;

pub use message::{MessageKind, Role, StoredMessage};
pub use store::{FileMeta, SessionMeta, SessionStore, SessionSummary};
