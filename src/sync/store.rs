//! Store pipeline: append source messages missing from a destination.
//!
//! The source scan fans every message out to one appender pool per
//! destination. An appender searches its destination for the
//! Message-Id first, so a message lands in a destination at most once
//! per run no matter how appenders race. Bodies come from a shared
//! fetcher pool that consults the cache before touching the source, so
//! each body crosses the wire at most once ever.
//!
//! The pipeline outlives its feed in live mode: the idle reactor keeps
//! sending into `dest_txs` until shutdown, which is why spawning and
//! feeding are separate steps.

use futures::future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::MessageCache;
use crate::imap::connection;
use crate::imap::ops;
use crate::imap::{ImapSession, SessionPool};
use crate::sync::scan;
use crate::types::{
    FetchRequest, MailcastError, MessageData, Result, WorkRequest, MAX_WORKER_FAILURES,
    NOOP_MINUTES,
};

/// True when a cache entry can satisfy a fetch request outright.
pub fn cache_entry_usable(entry: Option<&MessageData>) -> bool {
    matches!(entry, Some(data) if !data.is_empty())
}

/// Running store workers: per-destination appender channels plus the
/// shared fetcher channel. Dropping `dest_txs` (via [`shutdown`]) is
/// the "no more work" signal.
///
/// [`shutdown`]: StorePipeline::shutdown
pub struct StorePipeline {
    pub dest_txs: Vec<flume::Sender<WorkRequest>>,
    fetch_tx: flume::Sender<FetchRequest>,
    fetcher_handles: Vec<JoinHandle<Option<ImapSession>>>,
    appender_handles: Vec<Vec<JoinHandle<Option<ImapSession>>>>,
}

impl StorePipeline {
    /// Spawn fetchers over the source sessions and one appender pool
    /// per destination.
    pub fn spawn(
        source_sessions: Vec<ImapSession>,
        dests: Vec<(String, Vec<ImapSession>)>,
        cache: &MessageCache,
    ) -> Self {
        let (fetch_tx, fetch_rx) = flume::bounded::<FetchRequest>(0);

        let fetcher_handles: Vec<_> = source_sessions
            .into_iter()
            .map(|session| tokio::spawn(run_fetcher(session, fetch_rx.clone(), cache.clone())))
            .collect();
        drop(fetch_rx);

        let mut dest_txs = Vec::with_capacity(dests.len());
        let mut appender_handles = Vec::with_capacity(dests.len());
        for (label, sessions) in dests {
            let (work_tx, work_rx) = flume::bounded::<WorkRequest>(0);
            let handles: Vec<_> = sessions
                .into_iter()
                .map(|session| {
                    tokio::spawn(run_appender(
                        session,
                        work_rx.clone(),
                        fetch_tx.clone(),
                        label.clone(),
                    ))
                })
                .collect();
            dest_txs.push(work_tx);
            appender_handles.push(handles);
        }

        Self {
            dest_txs,
            fetch_tx,
            fetcher_handles,
            appender_handles,
        }
    }

    /// Close the work channels, drain the workers, and collect the
    /// surviving sessions (source first, then one vec per destination).
    pub async fn shutdown(self) -> (Vec<ImapSession>, Vec<Vec<ImapSession>>) {
        drop(self.dest_txs);

        let mut dest_sessions = Vec::with_capacity(self.appender_handles.len());
        for handles in self.appender_handles {
            let survivors: Vec<ImapSession> = future::join_all(handles)
                .await
                .into_iter()
                .filter_map(|joined| joined.ok().flatten())
                .collect();
            dest_sessions.push(survivors);
        }

        // only now can the fetchers go; appenders may have had fetches
        // in flight until the line above completed
        drop(self.fetch_tx);
        let source_sessions: Vec<ImapSession> = future::join_all(self.fetcher_handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok().flatten())
            .collect();

        (source_sessions, dest_sessions)
    }
}

/// One-shot store pass: scan the source and run it through the
/// pipeline to completion.
pub async fn run(pool: &mut SessionPool, cache: &MessageCache, quick: Option<u32>) -> Result<()> {
    info!("starting store pipeline");

    let mut source_sessions = pool.source.take_sessions();
    if source_sessions.is_empty() {
        return Err(MailcastError::Protocol(
            "no source sessions available for the store pass".into(),
        ));
    }

    let entries = match scan::scan_mailbox(&mut source_sessions[0], true, quick).await {
        Ok(entries) => entries,
        Err(e) => {
            pool.source.restore_sessions(source_sessions);
            return Err(e);
        }
    };
    info!(messages = entries.len(), "beginning store pass");

    let dests: Vec<(String, Vec<ImapSession>)> = pool
        .dests
        .iter_mut()
        .map(|dest| {
            let label = format!("{}@{}", dest.info.user, dest.info.host);
            (label, dest.take_sessions())
        })
        .collect();

    let pipeline = StorePipeline::spawn(source_sessions, dests, cache);
    let sent = scan::feed(entries, &pipeline.dest_txs, "store").await;
    debug!(sent, "store feed complete");

    let (source_back, dests_back) = pipeline.shutdown().await;
    pool.source.restore_sessions(source_back);
    for (dest, survivors) in pool.dests.iter_mut().zip(dests_back) {
        dest.restore_sessions(survivors);
    }

    info!("store pipeline complete");
    Ok(())
}

/// Appender worker: one per destination session.
async fn run_appender(
    mut session: ImapSession,
    work_rx: flume::Receiver<WorkRequest>,
    fetch_tx: flume::Sender<FetchRequest>,
    label: String,
) -> Option<ImapSession> {
    let mut keepalive = interval(Duration::from_secs(NOOP_MINUTES * 60));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.reset();

    let mut failures = 0u32;

    loop {
        tokio::select! {
            request = work_rx.recv_async() => {
                let Ok(mut request) = request else { break };

                if request.value.is_empty() {
                    warn!(dest = %label, uid = request.uid, "no Message-Id, skipping append");
                    continue;
                }

                // pre-append search: a destination receives a given
                // Message-Id at most once per run
                let found = loop {
                    match ops::message_exists(&mut session, &request.value).await {
                        Ok(found) => {
                            failures = 0;
                            break found;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(
                                dest = %label,
                                failures,
                                "destination search failed for {}: {e}",
                                request.value
                            );
                            if failures >= MAX_WORKER_FAILURES {
                                error!(dest = %label, "appender giving up after repeated failures");
                                connection::logout(session).await;
                                return None;
                            }
                            let _ = connection::reset(&mut session, false).await;
                        }
                    }
                };
                if found {
                    continue;
                }

                // idle-path requests already carry the body
                let data = match request.data.take().filter(|d| !d.is_empty()) {
                    Some(data) => data,
                    None => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let fetch = FetchRequest {
                            message_id: request.value.clone(),
                            uid: request.uid,
                            reply: reply_tx,
                        };
                        if fetch_tx.send_async(fetch).await.is_err() {
                            warn!(dest = %label, "fetcher pool gone, skipping {}", request.value);
                            continue;
                        }
                        reply_rx.await.unwrap_or_default()
                    }
                };
                if data.is_empty() {
                    warn!(dest = %label, "no data for {}, skipping append", request.value);
                    continue;
                }

                info!(dest = %label, "appending {}", request.value);
                loop {
                    match ops::append_message(&mut session, &data).await {
                        Ok(()) => {
                            failures = 0;
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(dest = %label, failures, "append failed for {}: {e}", request.value);
                            if failures >= MAX_WORKER_FAILURES {
                                error!(dest = %label, "appender giving up after repeated failures");
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

    debug!(dest = %label, "appender complete");
    Some(session)
}

/// Fetcher worker: one per source session, cache-first.
async fn run_fetcher(
    mut session: ImapSession,
    fetch_rx: flume::Receiver<FetchRequest>,
    cache: MessageCache,
) -> Option<ImapSession> {
    let mut keepalive = interval(Duration::from_secs(NOOP_MINUTES * 60));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.reset();

    let mut failures = 0u32;

    loop {
        tokio::select! {
            request = fetch_rx.recv_async() => {
                let Ok(request) = request else { break };

                match cache.get(&request.message_id) {
                    Ok(entry) if cache_entry_usable(entry.as_ref()) => {
                        let _ = request.reply.send(entry.unwrap_or_default());
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("cache read failed for {}, fetching from source: {e}", request.message_id);
                    }
                }

                let mut data = MessageData::default();
                loop {
                    match ops::fetch_message(&mut session, request.uid).await {
                        Ok(Some(fetched)) => {
                            failures = 0;
                            data = fetched;
                            break;
                        }
                        Ok(None) => {
                            failures = 0;
                            info!(uid = request.uid, "no data found, skipping");
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(uid = request.uid, failures, "fetch failed: {e}");
                            if failures >= MAX_WORKER_FAILURES {
                                break;
                            }
                            let _ = connection::reset(&mut session, true).await;
                        }
                    }
                }

                if !data.is_empty() {
                    if let Err(e) = cache.put(&request.message_id, &data) {
                        warn!("unable to cache {}: {e}", request.message_id);
                    }
                }
                let _ = request.reply.send(data);

                if failures >= MAX_WORKER_FAILURES {
                    error!("fetcher giving up after repeated failures");
                    connection::logout(session).await;
                    return None;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = ops::noop(&mut session).await {
                    warn!("keep-alive NOOP failed: {e}");
                }
            }
        }
    }

    debug!("fetcher complete");
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn usable_cache_entries_need_a_body() {
        assert!(!cache_entry_usable(None));

        let empty = MessageData {
            internal_date: Utc::now(),
            body: Vec::new(),
        };
        assert!(!cache_entry_usable(Some(&empty)));

        let full = MessageData {
            internal_date: Utc::now(),
            body: b"raw message".to_vec(),
        };
        assert!(cache_entry_usable(Some(&full)));
    }
}
