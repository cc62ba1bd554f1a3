//! The wire-level operations the pipelines are built from.
//!
//! Each function issues exactly one IMAP command on a caller-owned
//! session and translates the response into plain data. Sessions are
//! never shared; serialization is the caller's problem (each worker
//! owns its session outright).

use async_imap::types::Fetch;
use chrono::Utc;
use futures::TryStreamExt;
use tracing::debug;

use crate::imap::connection::{ImapSession, MAILBOX};
use crate::types::{MessageData, Result};

/// One scanned header: the UID and whatever `Message-Id` said (possibly
/// empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub uid: u32,
    pub message_id: String,
}

/// Snapshot of the selected mailbox: message count and the next UID the
/// server will assign. The SELECT response carries UIDNEXT, so no
/// separate STATUS round-trip is needed.
pub async fn mailbox_snapshot(
    session: &mut ImapSession,
    read_only: bool,
) -> Result<(u32, Option<u32>)> {
    let mailbox = crate::imap::connection::select_mailbox(session, read_only).await?;
    Ok((mailbox.exists, mailbox.uid_next))
}

/// Fetch `(UID RFC822.HEADER)` for the given sequence range and extract
/// a `ScanEntry` per message.
pub async fn fetch_headers(session: &mut ImapSession, sequence_set: &str) -> Result<Vec<ScanEntry>> {
    let fetches: Vec<Fetch> = session
        .fetch(sequence_set, "(UID RFC822.HEADER)")
        .await?
        .try_collect()
        .await?;

    let mut entries = Vec::with_capacity(fetches.len());
    for fetch in &fetches {
        let Some(uid) = fetch.uid else { continue };
        let header = fetch.header().unwrap_or_default();
        entries.push(ScanEntry {
            uid,
            message_id: message_id_from_header(header),
        });
    }
    Ok(entries)
}

/// Pull one full message by UID. Returns `None` when the server has no
/// data for the UID (it may have been expunged since it was scanned).
pub async fn fetch_message(session: &mut ImapSession, uid: u32) -> Result<Option<MessageData>> {
    let fetches: Vec<Fetch> = session
        .uid_fetch(uid.to_string(), "(INTERNALDATE BODY[] UID RFC822.HEADER)")
        .await?
        .try_collect()
        .await?;

    for fetch in &fetches {
        if fetch.uid != Some(uid) {
            continue;
        }
        let Some(body) = fetch.body() else { continue };
        if body.is_empty() {
            continue;
        }
        let internal_date = fetch
            .internal_date()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        return Ok(Some(MessageData {
            internal_date,
            body: body.to_vec(),
        }));
    }
    Ok(None)
}

/// Append a message, preserving the source internal date. The `UnSeen`
/// flag literal is what this tool has always emitted; servers that
/// reject it surface an ordinary append error.
pub async fn append_message(session: &mut ImapSession, data: &MessageData) -> Result<()> {
    let internaldate = data
        .internal_date
        .fixed_offset()
        .format("%d-%b-%Y %H:%M:%S %z")
        .to_string();
    session
        .append(
            MAILBOX,
            Some("(UnSeen)"),
            Some(&format!("\"{internaldate}\"")),
            &data.body,
        )
        .await?;
    Ok(())
}

/// `UID SEARCH HEADER Message-Id "<value>"`; true iff any UID matched.
pub async fn message_exists(session: &mut ImapSession, message_id: &str) -> Result<bool> {
    let query = header_search_query(message_id);
    let uids = session.uid_search(&query).await?;
    Ok(!uids.is_empty())
}

/// Flag a destination UID `\Deleted`. The actual removal happens at the
/// end-of-run EXPUNGE.
pub async fn add_deleted_flag(session: &mut ImapSession, uid: u32) -> Result<()> {
    let mut responses = session
        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
        .await?;
    while let Some(response) = responses.try_next().await? {
        let _ = response;
    }
    Ok(())
}

/// Permanently remove everything flagged `\Deleted`.
pub async fn expunge(session: &mut ImapSession) -> Result<()> {
    let expunged: Vec<u32> = session.expunge().await?.try_collect().await?;
    debug!(count = expunged.len(), "expunged messages");
    Ok(())
}

pub async fn noop(session: &mut ImapSession) -> Result<()> {
    session.noop().await?;
    Ok(())
}

/// Build the `UID SEARCH` query for a Message-Id, quoting the value so
/// header values with spaces or parens cannot break the command.
pub fn header_search_query(message_id: &str) -> String {
    let escaped = message_id.replace('\\', "\\\\").replace('"', "\\\"");
    format!("HEADER Message-Id \"{escaped}\"")
}

/// Extract the Message-Id from a raw RFC822 header block.
///
/// Real mailboxes carry all three spellings, so each is tried in order
/// and the first non-empty value wins. An unparsable or absent header
/// yields an empty string; downstream workers treat that as "identity
/// unknown" and act conservatively.
pub fn message_id_from_header(header: &[u8]) -> String {
    let Ok((headers, _)) = mailparse::parse_headers(header) else {
        return String::new();
    };
    for key in ["Message-Id", "message-id", "Message-ID"] {
        let found = headers
            .iter()
            .find(|h| h.get_key_raw() == key.as_bytes())
            .map(|h| h.get_value());
        if let Some(value) = found {
            if !value.is_empty() {
                return value;
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_canonical_message_id() {
        let header = b"Subject: hi\r\nMessage-Id: <m1@example.com>\r\n\r\n";
        assert_eq!(message_id_from_header(header), "<m1@example.com>");
    }

    #[test]
    fn falls_back_through_capitalizations() {
        let lower = b"message-id: <lower@example.com>\r\n\r\n";
        assert_eq!(message_id_from_header(lower), "<lower@example.com>");

        let upper = b"Message-ID: <upper@example.com>\r\n\r\n";
        assert_eq!(message_id_from_header(upper), "<upper@example.com>");
    }

    #[test]
    fn first_non_empty_spelling_wins() {
        let header = b"Message-Id: \r\nMessage-ID: <second@example.com>\r\n\r\n";
        assert_eq!(message_id_from_header(header), "<second@example.com>");
    }

    #[test]
    fn missing_message_id_is_empty() {
        let header = b"Subject: no id here\r\n\r\n";
        assert_eq!(message_id_from_header(header), "");
        assert_eq!(message_id_from_header(b""), "");
    }

    #[test]
    fn search_query_quotes_and_escapes() {
        assert_eq!(
            header_search_query("<m1@example.com>"),
            "HEADER Message-Id \"<m1@example.com>\""
        );
        assert_eq!(
            header_search_query("<a \"b\"@c>"),
            "HEADER Message-Id \"<a \\\"b\\\"@c>\""
        );
    }
}
