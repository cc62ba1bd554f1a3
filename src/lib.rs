//! mailcast keeps one or more destination IMAP INBOXes equal to a
//! single source INBOX: a one-shot reconciliation (append what is
//! missing, optionally purge what the source no longer has) and an
//! optional live mode that follows server-pushed IDLE notifications.
//!
//! Identity is the RFC 5322 `Message-Id` header; bodies are carried
//! bit-for-bit with their server internal dates and cached on disk so
//! each message crosses the wire at most once.

pub mod cache;
pub mod config;
pub mod imap;
pub mod logging;
pub mod sync;
pub mod types;

pub use cache::MessageCache;
pub use config::{Config, InboxInfo, RunOptions};
pub use sync::Replicator;
pub use types::{MailcastError, Result};
