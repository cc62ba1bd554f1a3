//! Credentials and run configuration.
//!
//! A run is described by one source mailbox and one or more destination
//! mailboxes, either from individual CLI flags or from a JSON config
//! file. All credential fields are required; a run never starts with a
//! partially specified endpoint.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{MailcastError, Result};

/// Default number of sessions opened per endpoint.
pub const DEFAULT_SESSIONS_PER_ENDPOINT: i32 = 2;

/// Default tail length for quick sync.
pub const DEFAULT_QUICK_COUNT: u32 = 500;

/// Default cache store directory.
pub const DEFAULT_DB_PATH: &str = "/var/mailcast/messages";

/// Login credentials for one IMAP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxInfo {
    pub user: String,
    /// The JSON key `pw` is accepted for compatibility with older
    /// config files.
    #[serde(alias = "pw")]
    pub password: String,
    pub host: String,
}

impl InboxInfo {
    pub fn new(user: &str, password: &str, host: &str) -> Result<Self> {
        let info = Self {
            user: user.to_string(),
            password: password.to_string(),
            host: host.to_string(),
        };
        info.validate()?;
        Ok(info)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(MailcastError::Config("login ID is required".into()));
        }
        if self.password.is_empty() {
            return Err(MailcastError::Config("login password is required".into()));
        }
        if self.host.is_empty() {
            return Err(MailcastError::Config("IMAP host is required".into()));
        }
        Ok(())
    }
}

/// Config-file layout: one source, any number of destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: InboxInfo,
    pub dest: Vec<InboxInfo>,
}

impl Config {
    /// Parse and validate a JSON config document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| MailcastError::Config(format!("invalid config file: {e}")))?;
        config.source.validate()?;
        if config.dest.is_empty() {
            return Err(MailcastError::Config(
                "at least one destination is required".into(),
            ));
        }
        for info in &config.dest {
            info.validate()?;
        }
        Ok(config)
    }
}

/// Render the JSON skeleton printed by `--example-config`.
pub fn example_config() -> String {
    r#"{
    "source": {
        "user": "source_user_name",
        "password": "source_pa$$w0rd",
        "host": "imap.source.com"
    },
    "dest": [
        {
            "user": "dest1_user_name",
            "password": "dest1_pa$$w0rd",
            "host": "imap.dest1.com"
        },
        {
            "user": "dest2_user_name",
            "password": "dest2_pa$$w0rd",
            "host": "imap.dest2.com"
        }
    ]
}
"#
    .to_string()
}

/// Everything the orchestrator needs beyond credentials.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Enter the idle reactor after the initial sync.
    pub idle: bool,
    /// Perform the store pass.
    pub sync: bool,
    /// Perform the purge pass before the store pass.
    pub purge: bool,
    /// When set, only the most recent tail of the mailbox is scanned.
    pub quick_count: Option<u32>,
    /// Sessions opened per endpoint.
    pub sessions_per_endpoint: usize,
    /// Cache store directory.
    pub db_path: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            idle: false,
            sync: true,
            purge: false,
            quick_count: None,
            sessions_per_endpoint: DEFAULT_SESSIONS_PER_ENDPOINT as usize,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

/// Clamp the `-c` flag. Non-positive values select a generous pool of
/// ten sessions, matching the behavior this tool has always shipped.
pub fn clamp_session_count(requested: i32) -> usize {
    if requested <= 0 {
        10
    } else {
        requested as usize
    }
}

/// Resolve the `--quick` / `--quick-count` pair into an effective tail
/// length. Quick sync is off unless explicitly enabled.
pub fn resolve_quick_count(quick: bool, quick_count: u32) -> Option<u32> {
    if quick {
        Some(quick_count)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_info_requires_all_fields() {
        assert!(InboxInfo::new("user", "pw", "host").is_ok());
        assert!(InboxInfo::new("", "pw", "host").is_err());
        assert!(InboxInfo::new("user", "", "host").is_err());
        assert!(InboxInfo::new("user", "pw", "").is_err());
    }

    #[test]
    fn config_parses_canonical_json() {
        let raw = r#"{
            "source": {"user": "a", "password": "b", "host": "imap.a.com"},
            "dest": [{"user": "c", "password": "d", "host": "imap.b.com"}]
        }"#;
        let config = Config::from_json(raw).unwrap();
        assert_eq!(config.source.user, "a");
        assert_eq!(config.dest.len(), 1);
        assert_eq!(config.dest[0].host, "imap.b.com");
    }

    #[test]
    fn config_accepts_pw_alias() {
        let raw = r#"{
            "source": {"user": "a", "pw": "b", "host": "imap.a.com"},
            "dest": [{"user": "c", "pw": "d", "host": "imap.b.com"}]
        }"#;
        let config = Config::from_json(raw).unwrap();
        assert_eq!(config.source.password, "b");
        assert_eq!(config.dest[0].password, "d");
    }

    #[test]
    fn config_rejects_missing_fields() {
        let raw = r#"{
            "source": {"user": "a", "password": "", "host": "imap.a.com"},
            "dest": [{"user": "c", "password": "d", "host": "imap.b.com"}]
        }"#;
        assert!(Config::from_json(raw).is_err());

        let raw = r#"{"source": {"user": "a", "password": "b", "host": "h"}, "dest": []}"#;
        assert!(Config::from_json(raw).is_err());
    }

    #[test]
    fn example_config_round_trips() {
        let config = Config::from_json(&example_config()).unwrap();
        assert_eq!(config.dest.len(), 2);
    }

    #[test]
    fn session_count_clamps_non_positive_values() {
        assert_eq!(clamp_session_count(2), 2);
        assert_eq!(clamp_session_count(1), 1);
        assert_eq!(clamp_session_count(0), 10);
        assert_eq!(clamp_session_count(-3), 10);
    }

    #[test]
    fn quick_count_requires_the_quick_flag() {
        assert_eq!(resolve_quick_count(false, 500), None);
        assert_eq!(resolve_quick_count(true, 500), Some(500));
        assert_eq!(resolve_quick_count(true, 10), Some(10));
    }
}
