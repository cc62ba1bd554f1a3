use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum MailcastError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] async_native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("cache pool error: {0}")]
    CachePool(#[from] r2d2::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T, E = MailcastError> = std::result::Result<T, E>;
