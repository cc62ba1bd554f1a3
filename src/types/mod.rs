//! Shared data types and channel envelopes for the sync pipelines.
//!
//! All worker coordination is by typed channels: work channels are
//! rendezvous flume channels (a closed channel means "no more work",
//! and downstream workers drain then exit), while replies travel over
//! single-use oneshot channels embedded in the request.

pub mod error;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

pub use error::{MailcastError, Result};

/// The header used to identify messages across mailboxes.
pub const MESSAGE_ID_HEADER: &str = "Message-Id";

/// Keep-alive NOOP period for workers that may sit idle on a channel.
pub const NOOP_MINUTES: u64 = 15;

/// IDLE is re-armed on this period, safely below the 29-minute ceiling
/// of RFC 2177.
pub const IDLE_TIMEOUT_MINUTES: u64 = 20;

/// Capacity of the buffered purge-signal channel; a full channel means
/// a purge is already pending and the signal is dropped.
pub const PURGE_SIGNAL_CAPACITY: usize = 100;

/// Consecutive transient failures a worker absorbs before exiting.
pub const MAX_WORKER_FAILURES: u32 = 5;

/// Progress is logged once per this many scanned messages.
pub const PROGRESS_INTERVAL: u64 = 100;

/// A message body together with the server-assigned reception time.
///
/// This is what the cache and the append path carry. An empty body is
/// the "no data" sentinel on the fetch path.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageData {
    pub internal_date: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl Default for MessageData {
    fn default() -> Self {
        Self {
            internal_date: DateTime::<Utc>::UNIX_EPOCH,
            body: Vec::new(),
        }
    }
}

impl MessageData {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// One unit of per-message work emitted by the header scanner.
///
/// `value` is whatever the RFC 5322 `Message-Id` header said and may be
/// empty; downstream workers decide what that means. `data` is
/// pre-populated only on the idle path, where the reactor has already
/// fetched the body.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub header: &'static str,
    pub value: String,
    pub uid: u32,
    pub data: Option<MessageData>,
}

impl WorkRequest {
    pub fn new(value: String, uid: u32) -> Self {
        Self {
            header: MESSAGE_ID_HEADER,
            value,
            uid,
            data: None,
        }
    }
}

/// Purger -> Checker: does this Message-Id exist in the source?
///
/// The reply is `true` when the message is present, and also `true`
/// when the check could not be completed: an unconfirmed absence must
/// never trigger a deletion.
#[derive(Debug)]
pub struct CheckExistsRequest {
    pub message_id: String,
    pub uid: u32,
    pub reply: oneshot::Sender<bool>,
}

/// Appender -> Fetcher: produce the body for this source UID.
///
/// Replying with empty `MessageData` means the message could not be
/// fetched and the appender should skip it.
#[derive(Debug)]
pub struct FetchRequest {
    pub message_id: String,
    pub uid: u32,
    pub reply: oneshot::Sender<MessageData>,
}
