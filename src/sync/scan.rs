//! Header scanner: turns a mailbox into a sequence of `WorkRequest`s.
//!
//! The scan itself is a single `FETCH <range> (UID RFC822.HEADER)`;
//! feeding the resulting requests into the worker channels is where a
//! run spends its time, so progress (with an instantaneous rate) is
//! logged every hundred messages during the feed.

use std::time::Instant;

use tracing::{info, warn};

use crate::imap::ops::{self, ScanEntry};
use crate::imap::ImapSession;
use crate::types::{Result, WorkRequest, PROGRESS_INTERVAL};

/// Compute the FETCH sequence range for a scan.
///
/// Quick sync reconciles only the most recent `k` messages; a tail
/// longer than the mailbox degenerates to a full scan. `None` means the
/// mailbox is empty and no FETCH should be issued at all.
pub fn scan_range(total: u32, quick_count: Option<u32>) -> Option<String> {
    if total == 0 {
        return None;
    }
    let start = match quick_count {
        Some(k) if k > 0 && k < total => total - k + 1,
        _ => 1,
    };
    Some(format!("{start}:*"))
}

/// Scan a mailbox's headers, honoring quick sync.
///
/// The session must already have INBOX selected; the scan re-selects to
/// get a fresh message count before fetching.
pub async fn scan_mailbox(
    session: &mut ImapSession,
    read_only: bool,
    quick_count: Option<u32>,
) -> Result<Vec<ScanEntry>> {
    let (total, _) = ops::mailbox_snapshot(session, read_only).await?;
    let Some(range) = scan_range(total, quick_count) else {
        info!("mailbox is empty, nothing to scan");
        return Ok(Vec::new());
    };

    info!(total, range = %range, "scanning mailbox headers");
    ops::fetch_headers(session, &range).await
}

/// Feed scanned entries to every sink, fanning each request out, with
/// rate-logged progress.
pub async fn feed(
    entries: Vec<ScanEntry>,
    sinks: &[flume::Sender<WorkRequest>],
    label: &str,
) -> usize {
    let mut sent = 0usize;
    let mut window_start = Instant::now();
    let mut active: Vec<&flume::Sender<WorkRequest>> = sinks.iter().collect();

    for entry in entries {
        let request = WorkRequest::new(entry.message_id, entry.uid);

        // a send fails only when every worker on the other side has
        // exited; that sink is done but the others keep going
        let mut i = 0;
        while i < active.len() {
            if active[i].send_async(request.clone()).await.is_err() {
                warn!(label, "a worker pool went away, continuing without it");
                active.swap_remove(i);
            } else {
                i += 1;
            }
        }
        if active.is_empty() {
            info!(label, sent, "all worker pools gone, stopping feed");
            return sent;
        }

        sent += 1;
        if sent as u64 % PROGRESS_INTERVAL == 0 {
            let rate = PROGRESS_INTERVAL as f64 / window_start.elapsed().as_secs_f64().max(1e-9);
            info!(label, processed = sent, "progress: {:.1} msg/s", rate);
            window_start = Instant::now();
        }
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: u32) -> Vec<ScanEntry> {
        (1..=n)
            .map(|uid| ScanEntry {
                uid,
                message_id: format!("<m{uid}@example.com>"),
            })
            .collect()
    }

    #[tokio::test]
    async fn feed_fans_out_to_every_sink() {
        let (tx_a, rx_a) = flume::bounded::<WorkRequest>(0);
        let (tx_b, rx_b) = flume::bounded::<WorkRequest>(0);

        let drain_a = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Ok(req) = rx_a.recv_async().await {
                got.push(req.value);
            }
            got
        });
        let drain_b = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Ok(req) = rx_b.recv_async().await {
                got.push(req.uid);
            }
            got
        });

        let sent = feed(entries(5), &[tx_a, tx_b], "test").await;
        assert_eq!(sent, 5);

        let values = drain_a.await.unwrap();
        let uids = drain_b.await.unwrap();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], "<m1@example.com>");
        assert_eq!(uids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn feed_outlives_a_dead_sink() {
        let (tx_dead, rx_dead) = flume::bounded::<WorkRequest>(0);
        drop(rx_dead);
        let (tx_live, rx_live) = flume::bounded::<WorkRequest>(0);

        let drain = tokio::spawn(async move {
            let mut count = 0;
            while rx_live.recv_async().await.is_ok() {
                count += 1;
            }
            count
        });

        let sent = feed(entries(3), &[tx_dead, tx_live], "test").await;
        assert_eq!(sent, 3);
        assert_eq!(drain.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn feed_stops_when_every_sink_is_gone() {
        let (tx, rx) = flume::bounded::<WorkRequest>(0);
        drop(rx);

        let sent = feed(entries(3), &[tx], "test").await;
        assert_eq!(sent, 0);
    }

    #[test]
    fn full_scan_starts_at_one() {
        assert_eq!(scan_range(1000, None).as_deref(), Some("1:*"));
        assert_eq!(scan_range(1, None).as_deref(), Some("1:*"));
    }

    #[test]
    fn quick_scan_takes_the_tail() {
        // a 1000-message mailbox with a 10-message tail covers
        // sequence numbers 991 through 1000
        assert_eq!(scan_range(1000, Some(10)).as_deref(), Some("991:*"));
        assert_eq!(scan_range(1000, Some(999)).as_deref(), Some("2:*"));
    }

    #[test]
    fn oversized_tail_is_a_full_scan() {
        assert_eq!(scan_range(100, Some(100)).as_deref(), Some("1:*"));
        assert_eq!(scan_range(100, Some(500)).as_deref(), Some("1:*"));
    }

    #[test]
    fn zero_tail_is_a_full_scan() {
        assert_eq!(scan_range(100, Some(0)).as_deref(), Some("1:*"));
    }

    #[test]
    fn empty_mailbox_skips_the_fetch() {
        assert_eq!(scan_range(0, None), None);
        assert_eq!(scan_range(0, Some(10)), None);
    }
}
