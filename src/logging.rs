//! Logging setup.
//!
//! Logs go to stderr by default. With `--log <path>` they go to a file
//! through a shared handle that SIGHUP reopens, so logrotate can move
//! the file aside and signal the process without losing output.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::types::Result;

const DEFAULT_FILTER: &str = "mailcast=info";

/// A log sink whose backing file can be swapped out at runtime.
#[derive(Clone)]
pub struct ReopenableWriter {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Reopen the file at the same path, picking up whatever logrotate
    /// left there. Writers created before the swap keep working; they
    /// all share this handle.
    pub fn reopen(&self) -> io::Result<()> {
        let file = open_log_file(&self.path)?;
        if let Ok(mut guard) = self.file.lock() {
            *guard = file;
        }
        Ok(())
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct WriterHandle(Arc<Mutex<File>>);

impl Write for WriterHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            // a poisoned lock means another writer panicked mid-write;
            // dropping this record beats taking the process down
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for ReopenableWriter {
    type Writer = WriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        WriterHandle(self.file.clone())
    }
}

/// Install the global subscriber. Must run inside the runtime so the
/// SIGHUP listener can be spawned.
pub fn init(log_path: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match log_path {
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
        Some(path) => {
            let writer = ReopenableWriter::open(path)?;
            spawn_reopen_on_hup(writer.clone());
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
        }
    }
    Ok(())
}

fn spawn_reopen_on_hup(writer: ReopenableWriter) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                error!("unable to install SIGHUP handler, log rotation disabled");
                return;
            };
            while hup.recv().await.is_some() {
                match writer.reopen() {
                    Ok(()) => info!("log file reopened"),
                    Err(e) => error!("unable to reopen log file: {e}"),
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = writer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reopen_switches_to_a_fresh_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mailcast.log");

        let writer = ReopenableWriter::open(&path).unwrap();
        let mut handle = writer.make_writer();
        handle.write_all(b"before rotation\n").unwrap();
        handle.flush().unwrap();

        // simulate logrotate: move the file aside, then signal reopen
        let rotated = dir.path().join("mailcast.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        writer.reopen().unwrap();

        let mut handle = writer.make_writer();
        handle.write_all(b"after rotation\n").unwrap();
        handle.flush().unwrap();

        let old = std::fs::read_to_string(&rotated).unwrap();
        let new = std::fs::read_to_string(&path).unwrap();
        assert!(old.contains("before rotation"));
        assert!(new.contains("after rotation"));
        assert!(!new.contains("before rotation"));
    }
}
