//! Orchestrator: owns the run lifecycle.
//!
//! One-shot mode opens the pools, runs the requested passes, and tears
//! everything down. Live mode additionally opens a dedicated idle
//! session, keeps a store pipeline warm for the reactor, and restarts
//! the whole cycle with fresh sessions whenever the reactor returns
//! with an error.

use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::cache::MessageCache;
use crate::config::{InboxInfo, RunOptions};
use crate::imap::{connection, ImapSession, SessionPool};
use crate::sync::store::StorePipeline;
use crate::sync::{idle, purge, store};
use crate::types::{MailcastError, Result, PURGE_SIGNAL_CAPACITY};

/// Pause between live-mode reconnect attempts, so a dead server is not
/// hammered in a tight loop.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// One source, many destinations, and everything needed to reconcile
/// them.
pub struct Replicator {
    source: InboxInfo,
    dests: Vec<InboxInfo>,
    cache: MessageCache,
    opts: RunOptions,
}

impl Replicator {
    pub fn new(source: InboxInfo, dests: Vec<InboxInfo>, opts: RunOptions) -> Result<Self> {
        source.validate()?;
        if dests.is_empty() {
            return Err(MailcastError::Config(
                "at least one destination is required".into(),
            ));
        }
        for dest in &dests {
            dest.validate()?;
        }

        let cache = MessageCache::open(&opts.db_path)?;
        if let Ok(cached) = cache.len() {
            info!(cached, db = %opts.db_path.display(), "message cache open");
        }

        Ok(Self {
            source,
            dests,
            cache,
            opts,
        })
    }

    pub async fn run(&self) -> Result<()> {
        if self.opts.idle {
            self.run_live().await
        } else {
            self.run_once().await
        }
    }

    /// One-shot reconciliation: optional purge pass, then store pass.
    async fn run_once(&self) -> Result<()> {
        let mut pool =
            SessionPool::open(&self.source, &self.dests, self.opts.sessions_per_endpoint).await?;

        let result = self.sync_passes(&mut pool).await;
        pool.close().await;
        result
    }

    async fn sync_passes(&self, pool: &mut SessionPool) -> Result<()> {
        if self.opts.purge {
            purge::run(pool, &self.cache, self.opts.quick_count).await?;
            if pool.exhausted() {
                return Err(MailcastError::Protocol(
                    "an endpoint lost all of its sessions during the purge pass".into(),
                ));
            }
        }
        if self.opts.sync {
            store::run(pool, &self.cache, self.opts.quick_count).await?;
        }
        Ok(())
    }

    /// Live mode: initial sync in the background, then follow the
    /// source until a termination signal. Any reactor error closes all
    /// sessions and restarts the cycle from scratch.
    async fn run_live(&self) -> Result<()> {
        let shutdown = spawn_signal_watch();

        let initial_sync = if self.opts.sync || self.opts.purge {
            Some(tokio::spawn(run_initial_sync(
                self.source.clone(),
                self.dests.clone(),
                self.cache.clone(),
                self.opts.clone(),
            )))
        } else {
            None
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.live_cycle(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    error!("idle cycle failed: {e}; reopening sessions");
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        }

        if let Some(handle) = initial_sync {
            if !handle.is_finished() {
                warn!("aborting in-flight initial sync for shutdown");
                handle.abort();
            }
            let _ = handle.await;
        }
        Ok(())
    }

    /// One live cycle: pools + idle session up, reactor until it
    /// returns, everything down.
    async fn live_cycle(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut pool =
            SessionPool::open(&self.source, &self.dests, self.opts.sessions_per_endpoint).await?;

        let idle_session = match pool.open_idle_session().await {
            Ok(session) => session,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        let source_sessions = pool.source.take_sessions();
        let dest_sessions: Vec<(String, Vec<ImapSession>)> = pool
            .dests
            .iter_mut()
            .map(|dest| {
                let label = format!("{}@{}", dest.info.user, dest.info.host);
                (label, dest.take_sessions())
            })
            .collect();
        let pipeline = StorePipeline::spawn(source_sessions, dest_sessions, &self.cache);

        let (purge_tx, purge_rx) = flume::bounded::<()>(PURGE_SIGNAL_CAPACITY);
        let drainer = tokio::spawn(idle::purge_drainer(
            purge_rx,
            self.source.clone(),
            self.dests.clone(),
            self.cache.clone(),
            self.opts.sessions_per_endpoint,
        ));

        let outcome = idle::run(
            idle_session,
            pipeline.dest_txs.clone(),
            purge_tx,
            self.cache.clone(),
            shutdown,
        )
        .await;

        let (source_back, dests_back) = pipeline.shutdown().await;
        pool.source.restore_sessions(source_back);
        for (dest, survivors) in pool.dests.iter_mut().zip(dests_back) {
            dest.restore_sessions(survivors);
        }
        pool.close().await;

        // the reactor dropped its purge sender; the drainer exits once
        // any in-flight purge finishes
        let _ = drainer.await;

        match outcome {
            Ok(session) => {
                connection::logout(session).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Initial sync for live mode, on its own pool so the reactor can start
/// following notifications immediately.
async fn run_initial_sync(
    source: InboxInfo,
    dests: Vec<InboxInfo>,
    cache: MessageCache,
    opts: RunOptions,
) {
    info!("starting initial sync");
    match SessionPool::open(&source, &dests, opts.sessions_per_endpoint).await {
        Ok(mut pool) => {
            if opts.purge {
                if let Err(e) = purge::run(&mut pool, &cache, opts.quick_count).await {
                    error!("initial purge pass failed: {e}");
                }
            }
            if opts.sync && !pool.exhausted() {
                if let Err(e) = store::run(&mut pool, &cache, opts.quick_count).await {
                    error!("initial store pass failed: {e}");
                }
            }
            pool.close().await;
            info!("initial sync complete");
        }
        Err(e) => error!("unable to open sessions for the initial sync: {e}"),
    }
}

/// Watch channel that flips to true on SIGINT/SIGTERM.
fn spawn_signal_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("received termination signal");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
