//! IMAP session plumbing: connections, pools, and the wire operations
//! the sync pipelines are built from.

pub mod connection;
pub mod ops;
pub mod pool;

pub use connection::{connect, logout, reset, ImapSession, MAILBOX};
pub use ops::ScanEntry;
pub use pool::{EndpointPool, SessionPool};
