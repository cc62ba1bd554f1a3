//! Persistent session pools.
//!
//! A run opens `N x (1 + |destinations|)` sessions up front: N
//! read-only sessions against the source and N read-write sessions
//! against every destination. Pipelines move sessions out of the pool
//! into worker tasks (each session is owned by exactly one worker at a
//! time) and hand the survivors back when their channel drains. A
//! session lost to repeated failures is never replaced mid-run; the
//! remaining workers absorb the load.

use tracing::{info, warn};

use crate::config::InboxInfo;
use crate::imap::connection::{self, ImapSession};
use crate::types::Result;

/// All open sessions for one endpoint.
pub struct EndpointPool {
    pub info: InboxInfo,
    pub read_only: bool,
    pub sessions: Vec<ImapSession>,
}

impl EndpointPool {
    pub async fn open(info: &InboxInfo, read_only: bool, count: usize) -> Result<Self> {
        let mut sessions = Vec::with_capacity(count);
        for _ in 0..count {
            sessions.push(connection::connect(info, read_only).await?);
        }
        Ok(Self {
            info: info.clone(),
            read_only,
            sessions,
        })
    }

    /// Move every session out for a pipeline run.
    pub fn take_sessions(&mut self) -> Vec<ImapSession> {
        std::mem::take(&mut self.sessions)
    }

    /// Hand surviving sessions back after a pipeline run.
    pub fn restore_sessions(&mut self, sessions: Vec<ImapSession>) {
        self.sessions = sessions;
    }

    pub async fn close(self) {
        for session in self.sessions {
            connection::logout(session).await;
        }
    }
}

/// The full set of pools for one run: one source endpoint plus every
/// destination endpoint.
pub struct SessionPool {
    pub source: EndpointPool,
    pub dests: Vec<EndpointPool>,
}

impl SessionPool {
    pub async fn open(
        source: &InboxInfo,
        dests: &[InboxInfo],
        sessions_per_endpoint: usize,
    ) -> Result<Self> {
        info!(
            sessions_per_endpoint,
            destinations = dests.len(),
            "opening session pools"
        );

        let source_pool = EndpointPool::open(source, true, sessions_per_endpoint).await?;
        let mut dest_pools = Vec::with_capacity(dests.len());
        for info in dests {
            dest_pools.push(EndpointPool::open(info, false, sessions_per_endpoint).await?);
        }

        Ok(Self {
            source: source_pool,
            dests: dest_pools,
        })
    }

    /// One extra read-only source session for the idle reactor.
    pub async fn open_idle_session(&self) -> Result<ImapSession> {
        connection::connect(&self.source.info, true).await
    }

    pub async fn close(self) {
        let session_count =
            self.source.sessions.len() + self.dests.iter().map(|d| d.sessions.len()).sum::<usize>();
        info!(session_count, "closing session pools");

        self.source.close().await;
        for dest in self.dests {
            dest.close().await;
        }
    }

    /// True when any endpoint has lost every session. Pipelines cannot
    /// make progress against such an endpoint.
    pub fn exhausted(&self) -> bool {
        if self.source.sessions.is_empty() {
            warn!("source pool has no surviving sessions");
            return true;
        }
        for dest in &self.dests {
            if dest.sessions.is_empty() {
                warn!(host = %dest.info.host, "destination pool has no surviving sessions");
                return true;
            }
        }
        false
    }
}
