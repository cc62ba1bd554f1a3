use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use tracing::error;

use mailcast::config::{self, clamp_session_count, resolve_quick_count, Config, InboxInfo};
use mailcast::types::MailcastError;
use mailcast::{logging, Replicator, Result, RunOptions};

/// Keep destination IMAP mailboxes identical to a source mailbox.
#[derive(Debug, Parser)]
#[command(name = "mailcast", version, about)]
struct Cli {
    /// The login ID for the source mailbox.
    #[arg(long = "src-id", default_value = "")]
    src_id: String,

    /// The login password for the source mailbox.
    #[arg(long = "src-pw", default_value = "")]
    src_pw: String,

    /// The IMAP host for the source mailbox.
    #[arg(long = "src-host", default_value = "")]
    src_host: String,

    /// The login ID for the destination mailbox.
    #[arg(long = "dst-id", default_value = "")]
    dst_id: String,

    /// The login password for the destination mailbox.
    #[arg(long = "dst-pw", default_value = "")]
    dst_pw: String,

    /// The IMAP host for the destination mailbox.
    #[arg(long = "dst-host", default_value = "")]
    dst_host: String,

    /// JSON config file holding the source and any number of
    /// destinations; overrides the individual credential flags. Use
    /// --example-config to see the format.
    #[arg(long = "config-file")]
    config_file: Option<PathBuf>,

    /// Print an example JSON config file and exit.
    #[arg(long = "example-config")]
    example_config: bool,

    /// After the initial sync, idle and follow source updates live.
    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true", action = ArgAction::Set)]
    idle: bool,

    /// Perform the store pass (append messages missing from the
    /// destinations).
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    sync: bool,

    /// Perform the purge pass (delete destination messages absent from
    /// the source) before the store pass.
    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true", action = ArgAction::Set)]
    purge: bool,

    /// Only reconcile the most recent tail of each mailbox.
    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true", action = ArgAction::Set)]
    quick: bool,

    /// Tail length for --quick.
    #[arg(long = "quick-count", default_value_t = config::DEFAULT_QUICK_COUNT)]
    quick_count: u32,

    /// Sessions opened per IMAP endpoint.
    #[arg(short = 'c', default_value_t = config::DEFAULT_SESSIONS_PER_ENDPOINT)]
    connections: i32,

    /// Write logs to this file instead of stderr; SIGHUP reopens it so
    /// logrotate works.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Directory for the on-disk message cache.
    #[arg(long, default_value = config::DEFAULT_DB_PATH)]
    db: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.example_config {
        print!("{}", config::example_config());
        return;
    }

    if let Err(e) = logging::init(cli.log.as_deref()) {
        eprintln!("unable to set up logging: {e}");
        process::exit(1);
    }

    let (source, dests) = match load_endpoints(&cli) {
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let opts = RunOptions {
        idle: cli.idle,
        sync: cli.sync,
        purge: cli.purge,
        quick_count: resolve_quick_count(cli.quick, cli.quick_count),
        sessions_per_endpoint: clamp_session_count(cli.connections),
        db_path: cli.db.clone(),
    };

    let replicator = match Replicator::new(source, dests, opts) {
        Ok(replicator) => replicator,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = replicator.run().await {
        error!("run failed: {e}");
        process::exit(1);
    }
}

/// Assemble the source and destination credentials from the config
/// file when given, otherwise from the individual flags.
fn load_endpoints(cli: &Cli) -> Result<(InboxInfo, Vec<InboxInfo>)> {
    match &cli.config_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                MailcastError::Config(format!("unable to read {}: {e}", path.display()))
            })?;
            let config = Config::from_json(&raw)?;
            Ok((config.source, config.dest))
        }
        None => {
            let source = InboxInfo::new(&cli.src_id, &cli.src_pw, &cli.src_host)
                .map_err(|e| MailcastError::Config(format!("source: {e}")))?;
            let dest = InboxInfo::new(&cli.dst_id, &cli.dst_pw, &cli.dst_host)
                .map_err(|e| MailcastError::Config(format!("destination: {e}")))?;
            Ok((source, vec![dest]))
        }
    }
}
