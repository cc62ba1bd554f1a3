//! Idle reactor: follow server-pushed notifications on a dedicated
//! source session and keep the destinations current in real time.
//!
//! The reactor sits in IDLE (re-armed every 20 minutes, under the
//! 29-minute ceiling of RFC 2177) and reduces every untagged response
//! to one of two events. EXISTS growth is handled inline: each new
//! message is fetched, cached, and fanned out to the destination
//! appender channels with its body attached. Everything ambiguous, a
//! shrinking EXISTS or any EXPUNGE, is answered by signalling a full
//! background purge instead of guessing; the purge pipeline's own
//! confirmation rules then decide what actually gets deleted.

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::MessageCache;
use crate::config::InboxInfo;
use crate::imap::ops;
use crate::imap::{ImapSession, SessionPool};
use crate::sync::{purge, scan};
use crate::types::{
    MailcastError, Result, WorkRequest, MESSAGE_ID_HEADER, IDLE_TIMEOUT_MINUTES,
};

/// A mailbox change the reactor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    /// Untagged `EXISTS`: the mailbox now holds this many messages.
    Exists(u32),
    /// Untagged `EXPUNGE`: the message at this sequence number is gone.
    Expunge(u32),
}

/// What an EXISTS notification means relative to the known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsAction {
    /// The mailbox shrank without an EXPUNGE we saw: reconcile with a
    /// background purge, never by guessing deletions.
    ShrinkPurge,
    /// This many messages were added after the snapshot.
    Append(u32),
}

pub fn exists_action(reported: u32, known: u32) -> ExistsAction {
    if reported < known {
        ExistsAction::ShrinkPurge
    } else {
        ExistsAction::Append(reported - known)
    }
}

/// Sequence-ordered Message-Id index for the source mailbox: entry `i`
/// is the message at sequence number `i + 1`. Lets an EXPUNGE
/// notification name the message it removed.
#[derive(Debug, Default)]
pub struct SeqIndex(Vec<String>);

impl SeqIndex {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, message_id: String) {
        self.0.push(message_id);
    }

    /// Drop the entry at a 1-based sequence number, returning its
    /// Message-Id. Out-of-range sequence numbers (a notification for a
    /// message scanned away earlier) return `None`.
    pub fn remove_seq(&mut self, seq: u32) -> Option<String> {
        let index = (seq as usize).checked_sub(1)?;
        if index < self.0.len() {
            Some(self.0.remove(index))
        } else {
            None
        }
    }
}

struct ReactorState {
    next_uid: u32,
    start_size: u32,
    index: SeqIndex,
}

/// Follow the source mailbox until shutdown is requested.
///
/// Returns the session on a clean, signal-driven exit. Any error
/// bubbles up so the orchestrator can tear everything down and restart
/// with fresh sessions.
pub async fn run(
    mut session: ImapSession,
    dest_txs: Vec<flume::Sender<WorkRequest>>,
    purge_tx: flume::Sender<()>,
    cache: MessageCache,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ImapSession> {
    let (exists, uid_next) = ops::mailbox_snapshot(&mut session, true).await?;
    let next_uid = uid_next
        .ok_or_else(|| MailcastError::Protocol("server did not report UIDNEXT".into()))?;

    // index and size snapshot come from the same SELECT, so sequence
    // numbers in later notifications line up with the index
    info!("building sequence index for the source mailbox");
    let index = match scan::scan_range(exists, None) {
        Some(range) => {
            let entries = ops::fetch_headers(&mut session, &range).await?;
            SeqIndex::new(entries.into_iter().map(|e| e.message_id).collect())
        }
        None => SeqIndex::default(),
    };

    let mut state = ReactorState {
        next_uid,
        start_size: exists,
        index,
    };
    info!(
        start_size = state.start_size,
        next_uid = state.next_uid,
        indexed = state.index.len(),
        "beginning idle"
    );

    loop {
        if *shutdown.borrow() {
            return Ok(session);
        }

        let mut handle = session.idle();
        handle.init().await?;
        let (wait, interrupt) =
            handle.wait_with_timeout(Duration::from_secs(IDLE_TIMEOUT_MINUTES * 60));

        let mut stop_requested = false;
        let response = tokio::select! {
            outcome = wait => Some(outcome?),
            _ = shutdown.changed() => {
                drop(interrupt);
                stop_requested = true;
                None
            }
        };

        // DONE is sent in every case; the server hands back any
        // notifications buffered while the idle was winding down
        session = handle.done().await?;

        if stop_requested {
            info!("termination requested, leaving idle");
            return Ok(session);
        }

        match &response {
            Some(IdleResponse::Timeout) => {
                debug!("idle re-arm timeout elapsed");
            }
            Some(IdleResponse::ManualInterrupt) => {
                debug!("idle interrupted");
            }
            Some(IdleResponse::NewData(_)) | None => {}
        }

        let mut events = Vec::new();
        if let Some(IdleResponse::NewData(data)) = &response {
            if let Some(event) = event_from_response(data.parsed()) {
                events.push(event);
            }
        }

        // handling an event issues commands, and those can surface
        // further untagged responses; keep draining until a pass comes
        // up empty
        loop {
            while let Ok(unsolicited) = session.unsolicited_responses.try_recv() {
                if let Some(event) = event_from_unsolicited(&unsolicited) {
                    events.push(event);
                }
            }
            if events.is_empty() {
                break;
            }
            for event in std::mem::take(&mut events) {
                handle_event(event, &mut session, &mut state, &dest_txs, &purge_tx, &cache)
                    .await?;
            }
        }
    }
}

async fn handle_event(
    event: MailboxEvent,
    session: &mut ImapSession,
    state: &mut ReactorState,
    dest_txs: &[flume::Sender<WorkRequest>],
    purge_tx: &flume::Sender<()>,
    cache: &MessageCache,
) -> Result<()> {
    match event {
        MailboxEvent::Exists(reported) => match exists_action(reported, state.start_size) {
            ExistsAction::ShrinkPurge => {
                warn!(
                    reported,
                    known = state.start_size,
                    "mailbox shrank, requesting purge"
                );
                request_purge(purge_tx);
                state.start_size = reported;
            }
            ExistsAction::Append(0) => {}
            ExistsAction::Append(count) => {
                info!(count, "new messages reported");
                for _ in 0..count {
                    append_new_message(session, state, dest_txs, purge_tx, cache).await?;
                }
            }
        },
        MailboxEvent::Expunge(seq) => {
            match state.index.remove_seq(seq) {
                Some(id) if !id.is_empty() => info!(seq, "source expunged {id}"),
                _ => info!(seq, "source expunged an untracked message"),
            }
            state.start_size = state.start_size.saturating_sub(1);
            request_purge(purge_tx);
        }
    }
    Ok(())
}

/// Fetch the next new message and fan it out to every destination with
/// its body attached, so appenders skip the fetcher round-trip.
async fn append_new_message(
    session: &mut ImapSession,
    state: &mut ReactorState,
    dest_txs: &[flume::Sender<WorkRequest>],
    purge_tx: &flume::Sender<()>,
    cache: &MessageCache,
) -> Result<()> {
    let uid = state.next_uid;

    match ops::fetch_message(session, uid).await? {
        Some(data) => {
            let message_id = ops::message_id_from_header(&data.body);
            if !message_id.is_empty() {
                if let Err(e) = cache.put(&message_id, &data) {
                    warn!("unable to cache {message_id}: {e}");
                }
            }

            let request = WorkRequest {
                header: MESSAGE_ID_HEADER,
                value: message_id.clone(),
                uid,
                data: Some(data),
            };
            for tx in dest_txs {
                if tx.send_async(request.clone()).await.is_err() {
                    warn!("appender pool gone, dropping live append");
                }
            }
            state.index.push(message_id);
        }
        None => {
            // announced but already gone; let a purge pass reconcile
            warn!(uid, "new message had no data");
            request_purge(purge_tx);
            state.index.push(String::new());
        }
    }

    state.next_uid += 1;
    state.start_size += 1;
    Ok(())
}

/// Non-blocking purge signal; a full channel means a purge is already
/// pending and the signal is dropped.
fn request_purge(purge_tx: &flume::Sender<()>) {
    match purge_tx.try_send(()) {
        Ok(()) => {}
        Err(flume::TrySendError::Full(())) => debug!("purge already pending"),
        Err(flume::TrySendError::Disconnected(())) => warn!("purge drainer gone"),
    }
}

/// Drain purge signals, running one full purge pipeline per burst on
/// freshly opened pools. Runs are serialized here, so rapid signals
/// coalesce.
pub async fn purge_drainer(
    purge_rx: flume::Receiver<()>,
    source: InboxInfo,
    dests: Vec<InboxInfo>,
    cache: MessageCache,
    sessions_per_endpoint: usize,
) {
    while purge_rx.recv_async().await.is_ok() {
        // collapse a burst of signals into a single run
        while purge_rx.try_recv().is_ok() {}

        info!("running idle-triggered purge");
        match SessionPool::open(&source, &dests, sessions_per_endpoint).await {
            Ok(mut pool) => {
                if let Err(e) = purge::run(&mut pool, &cache, None).await {
                    error!("idle-triggered purge failed: {e}");
                }
                pool.close().await;
            }
            Err(e) => error!("unable to open sessions for idle-triggered purge: {e}"),
        }
    }
}

fn event_from_response(response: &Response<'_>) -> Option<MailboxEvent> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(n)) => Some(MailboxEvent::Exists(*n)),
        Response::Expunge(n) => Some(MailboxEvent::Expunge(*n)),
        _ => None,
    }
}

fn event_from_unsolicited(response: &UnsolicitedResponse) -> Option<MailboxEvent> {
    match response {
        UnsolicitedResponse::Exists(n) => Some(MailboxEvent::Exists(*n)),
        UnsolicitedResponse::Expunge(n) => Some(MailboxEvent::Expunge(*n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrinking_exists_requests_a_purge() {
        assert_eq!(exists_action(5, 10), ExistsAction::ShrinkPurge);
        assert_eq!(exists_action(0, 1), ExistsAction::ShrinkPurge);
    }

    #[test]
    fn growing_exists_counts_new_messages() {
        assert_eq!(exists_action(10, 10), ExistsAction::Append(0));
        assert_eq!(exists_action(12, 10), ExistsAction::Append(2));
        assert_eq!(exists_action(1, 0), ExistsAction::Append(1));
    }

    #[test]
    fn seq_index_removes_by_sequence_number() {
        let mut index = SeqIndex::new(vec![
            "<m1@x>".to_string(),
            "<m2@x>".to_string(),
            "<m3@x>".to_string(),
        ]);

        assert_eq!(index.remove_seq(2).as_deref(), Some("<m2@x>"));
        // sequence numbers shift down after a removal
        assert_eq!(index.remove_seq(2).as_deref(), Some("<m3@x>"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn seq_index_tolerates_unknown_sequences() {
        let mut index = SeqIndex::new(vec!["<m1@x>".to_string()]);
        assert_eq!(index.remove_seq(0), None);
        assert_eq!(index.remove_seq(5), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn purge_signals_drop_when_one_is_pending() {
        let (tx, rx) = flume::bounded::<()>(1);

        request_purge(&tx);
        // channel full: a purge is already pending, the signal drops
        request_purge(&tx);
        request_purge(&tx);

        assert_eq!(rx.len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // once drained, a new signal lands again
        request_purge(&tx);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn seq_index_tracks_appends() {
        let mut index = SeqIndex::default();
        index.push("<m1@x>".to_string());
        index.push("<m2@x>".to_string());
        assert_eq!(index.remove_seq(1).as_deref(), Some("<m1@x>"));
        assert_eq!(index.remove_seq(1).as_deref(), Some("<m2@x>"));
        assert!(index.is_empty());
    }
}
