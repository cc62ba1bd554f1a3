//! Purge pipeline: remove destination messages that the source no
//! longer has.
//!
//! Every destination runs independently: its headers are scanned, each
//! message is checked against the source by a shared pool of checkers
//! holding source sessions, and confirmed-absent messages are flagged
//! `\Deleted` and expunged at the end of the destination's pass.
//!
//! Deletion safety is the whole point of this module. A message is
//! flagged only after a checker confirms, via a successful `UID SEARCH
//! HEADER Message-Id`, that the source returned no match. A failed
//! search replies "present", so a source timeout can never delete
//! destination mail. Messages without a Message-Id are left in place.

use futures::future;
use tokio::sync::oneshot;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::MessageCache;
use crate::imap::connection;
use crate::imap::ops;
use crate::imap::{ImapSession, SessionPool};
use crate::sync::scan;
use crate::types::{
    CheckExistsRequest, Result, WorkRequest, MAX_WORKER_FAILURES, NOOP_MINUTES,
};

/// What a purger should do with a checker's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Present in the source (or unconfirmed): leave the message alone.
    Keep,
    /// Confirmed absent from the source: flag for deletion.
    Delete,
}

/// Map a search result onto the reply a checker sends. Search errors
/// count as present; only a clean negative search confirms absence.
pub fn search_reply(result: &Result<bool>) -> bool {
    match result {
        Ok(found) => *found,
        Err(_) => true,
    }
}

/// Map the (possibly missing) reply a purger receives onto an action.
/// A dead checker means the check never completed, which is not a
/// confirmed absence.
pub fn check_outcome(reply: std::result::Result<bool, oneshot::error::RecvError>) -> CheckOutcome {
    match reply {
        Ok(false) => CheckOutcome::Delete,
        _ => CheckOutcome::Keep,
    }
}

/// Run the full purge pipeline over every destination in the pool.
pub async fn run(pool: &mut SessionPool, cache: &MessageCache, quick: Option<u32>) -> Result<()> {
    info!("starting purge pipeline");

    let (check_tx, check_rx) = flume::bounded::<CheckExistsRequest>(0);

    let mut checker_handles = Vec::new();
    for session in pool.source.take_sessions() {
        checker_handles.push(tokio::spawn(run_checker(
            session,
            check_rx.clone(),
            cache.clone(),
        )));
    }
    drop(check_rx);

    let mut dest_handles = Vec::new();
    for dest in pool.dests.iter_mut() {
        let label = format!("{}@{}", dest.info.user, dest.info.host);
        dest_handles.push(tokio::spawn(purge_destination(
            label,
            dest.take_sessions(),
            check_tx.clone(),
            quick,
        )));
    }
    // coordinators hold their own clones; the checker channel closes
    // once the last destination finishes
    drop(check_tx);

    for (dest, handle) in pool.dests.iter_mut().zip(dest_handles) {
        let survivors = handle.await.unwrap_or_default();
        dest.restore_sessions(survivors);
    }

    let mut source_survivors = Vec::new();
    for handle in checker_handles {
        if let Ok(Some(session)) = handle.await {
            source_survivors.push(session);
        }
    }
    pool.source.restore_sessions(source_survivors);

    info!("purge pipeline complete");
    Ok(())
}

/// Scan one destination and drive its purger workers; returns the
/// sessions that survived the pass.
async fn purge_destination(
    label: String,
    mut sessions: Vec<ImapSession>,
    check_tx: flume::Sender<CheckExistsRequest>,
    quick: Option<u32>,
) -> Vec<ImapSession> {
    if sessions.is_empty() {
        error!(dest = %label, "no sessions available, skipping purge");
        return sessions;
    }

    let entries = match scan::scan_mailbox(&mut sessions[0], false, quick).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(dest = %label, "unable to scan destination: {e}");
            return sessions;
        }
    };
    info!(dest = %label, messages = entries.len(), "beginning purge pass");

    let (work_tx, work_rx) = flume::bounded::<WorkRequest>(0);
    let mut handles = Vec::new();
    for session in sessions.drain(..) {
        handles.push(tokio::spawn(run_purger(
            session,
            work_rx.clone(),
            check_tx.clone(),
            label.clone(),
        )));
    }
    drop(work_rx);
    drop(check_tx);

    let feed_label = format!("purge {label}");
    scan::feed(entries, std::slice::from_ref(&work_tx), &feed_label).await;
    drop(work_tx);

    let mut survivors: Vec<ImapSession> = future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok().flatten())
        .collect();

    // per-message work is done; one session expunges for the whole
    // destination
    match survivors.first_mut() {
        Some(session) => {
            info!(dest = %label, "expunging");
            if let Err(e) = ops::expunge(session).await {
                error!(dest = %label, "expunge failed: {e}");
            }
        }
        None => warn!(dest = %label, "no surviving sessions, skipping expunge"),
    }

    survivors
}

/// Purger worker: one per destination session. Consults the checker
/// pool and flags confirmed-absent messages.
async fn run_purger(
    mut session: ImapSession,
    work_rx: flume::Receiver<WorkRequest>,
    check_tx: flume::Sender<CheckExistsRequest>,
    label: String,
) -> Option<ImapSession> {
    let mut keepalive = interval(Duration::from_secs(NOOP_MINUTES * 60));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.reset();

    let mut failures = 0u32;

    loop {
        tokio::select! {
            request = work_rx.recv_async() => {
                let Ok(request) = request else { break };

                if request.value.is_empty() {
                    // identity unknown: leave the message in place
                    debug!(dest = %label, uid = request.uid, "no Message-Id, keeping message");
                    continue;
                }

                let (reply_tx, reply_rx) = oneshot::channel();
                let check = CheckExistsRequest {
                    message_id: request.value.clone(),
                    uid: request.uid,
                    reply: reply_tx,
                };
                if check_tx.send_async(check).await.is_err() {
                    warn!(dest = %label, "checker pool gone, keeping message");
                    continue;
                }

                if check_outcome(reply_rx.await) != CheckOutcome::Delete {
                    continue;
                }

                info!(dest = %label, "absent from source, flagging for deletion: {}", request.value);
                loop {
                    match ops::add_deleted_flag(&mut session, request.uid).await {
                        Ok(()) => {
                            failures = 0;
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(
                                dest = %label,
                                uid = request.uid,
                                failures,
                                "unable to flag message: {e}"
                            );
                            if failures >= MAX_WORKER_FAILURES {
                                error!(dest = %label, "purger giving up after repeated failures");
                                connection::logout(session).await;
                                return None;
                            }
                            let _ = connection::reset(&mut session, false).await;
                        }
                    }
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = ops::noop(&mut session).await {
                    warn!(dest = %label, "keep-alive NOOP failed: {e}");
                }
            }
        }
    }

    debug!(dest = %label, "purger complete");
    Some(session)
}

/// Checker worker: one per source session. Answers existence queries
/// and prunes the cache on confirmed absence.
async fn run_checker(
    mut session: ImapSession,
    check_rx: flume::Receiver<CheckExistsRequest>,
    cache: MessageCache,
) -> Option<ImapSession> {
    let mut keepalive = interval(Duration::from_secs(NOOP_MINUTES * 60));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.reset();

    let mut failures = 0u32;

    loop {
        tokio::select! {
            request = check_rx.recv_async() => {
                let Ok(request) = request else { break };

                let result = ops::message_exists(&mut session, &request.message_id).await;
                let found = search_reply(&result);

                let failed = result.is_err();
                if let Err(e) = result {
                    failures += 1;
                    warn!(
                        failures,
                        "source search failed for {}, treating as present: {e}",
                        request.message_id
                    );
                } else {
                    failures = 0;
                }

                let _ = request.reply.send(found);

                // the source is known to lack this message; its cache
                // entry has nothing left to serve
                if !found {
                    if let Err(e) = cache.delete(&request.message_id) {
                        warn!("unable to drop cache entry {}: {e}", request.message_id);
                    }
                }

                if failed {
                    if failures >= MAX_WORKER_FAILURES {
                        error!("checker giving up after repeated failures");
                        connection::logout(session).await;
                        return None;
                    }
                    let _ = connection::reset(&mut session, true).await;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = ops::noop(&mut session).await {
                    warn!("keep-alive NOOP failed: {e}");
                }
            }
        }
    }

    debug!("checker complete");
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MailcastError;

    #[test]
    fn search_errors_read_as_present() {
        assert!(search_reply(&Err(MailcastError::Protocol("timeout".into()))));
        assert!(search_reply(&Ok(true)));
        assert!(!search_reply(&Ok(false)));
    }

    #[test]
    fn only_a_confirmed_negative_deletes() {
        let (tx, rx) = oneshot::channel::<bool>();
        tx.send(false).unwrap();
        assert_eq!(check_outcome(rx.blocking_recv()), CheckOutcome::Delete);

        let (tx, rx) = oneshot::channel::<bool>();
        tx.send(true).unwrap();
        assert_eq!(check_outcome(rx.blocking_recv()), CheckOutcome::Keep);

        // a checker that died without replying is not a confirmation
        let (tx, rx) = oneshot::channel::<bool>();
        drop(tx);
        assert_eq!(check_outcome(rx.blocking_recv()), CheckOutcome::Keep);
    }
}
