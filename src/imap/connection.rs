use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::InboxInfo;
use crate::types::Result;

/// The only mailbox this tool touches.
pub const MAILBOX: &str = "INBOX";

const IMAPS_PORT: u16 = 993;

// An IMAP session is generic over the stream type. Ours is
// TLS-encrypted TCP; this alias saves writing the full type everywhere.
pub type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

/// Open an authenticated session with INBOX selected.
///
/// Source sessions are opened read-only (EXAMINE), destination sessions
/// read-write (SELECT). Connect and auth failures are fatal for the
/// endpoint; callers abort pool construction rather than retry.
pub async fn connect(info: &InboxInfo, read_only: bool) -> Result<ImapSession> {
    info!(host = %info.host, user = %info.user, read_only, "connecting to IMAP server");

    let tcp = TcpStream::connect((info.host.as_str(), IMAPS_PORT)).await?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls.connect(&info.host, tcp).await?;

    let client = async_imap::Client::new(tls_stream);
    let mut session = client
        .login(&info.user, &info.password)
        .await
        .map_err(|(e, _)| e)?;

    select_mailbox(&mut session, read_only).await?;
    Ok(session)
}

/// Re-SELECT INBOX on an existing session.
pub async fn select_mailbox(
    session: &mut ImapSession,
    read_only: bool,
) -> Result<async_imap::types::Mailbox> {
    let mailbox = if read_only {
        session.examine(MAILBOX).await?
    } else {
        session.select(MAILBOX).await?
    };
    debug!(exists = mailbox.exists, read_only, "selected {}", MAILBOX);
    Ok(mailbox)
}

/// Recovery primitive for transient command failures: CLOSE the current
/// selection (tolerating a selection that is already gone) and SELECT
/// INBOX again. Workers call this before retrying a failed operation.
pub async fn reset(session: &mut ImapSession, read_only: bool) -> Result<()> {
    if let Err(e) = session.close().await {
        warn!("CLOSE during reset failed (continuing): {e}");
    }
    select_mailbox(session, read_only).await?;
    Ok(())
}

/// Best-effort LOGOUT used during teardown.
pub async fn logout(mut session: ImapSession) {
    if let Err(e) = session.logout().await {
        debug!("LOGOUT failed: {e}");
    }
}
