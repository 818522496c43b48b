//! Shared logging setup for Genie binaries.
//!
//! Logs go to two places: a size-rotated file under `$GENIE_HOME/logs/` (full
//! filter, no ANSI) and stderr (quiet unless `verbose`).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "genie=info,genie_pipeline=info";
const KEEP_ROTATED: usize = 4;
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;

/// Logging configuration shared by Genie binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let writer = SharedLogWriter::open(&log_dir, config.app_name)
        .context("Failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

/// Genie home directory: `$GENIE_HOME`, else `~/.genie`, else `./.genie`.
pub fn genie_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("GENIE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".genie"))
        .unwrap_or_else(|| PathBuf::from(".genie"))
}

/// Logs directory: `$GENIE_HOME/logs`
pub fn logs_dir() -> PathBuf {
    genie_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// A log file that is renamed to `<name>.log.1` (shifting older files up)
/// once it would grow past `limit` bytes.
struct RotatingLog {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            stem: sanitize_name(app_name),
            keep,
            limit,
            file: None,
            written: 0,
        };
        log.reopen()?;
        if log.written > log.limit {
            log.rotate()?;
        }
        Ok(log)
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn archived_path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, generation))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        if self.keep > 0 {
            let oldest = self.archived_path(self.keep);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for generation in (1..self.keep).rev() {
                let from = self.archived_path(generation);
                if from.exists() {
                    fs::rename(&from, self.archived_path(generation + 1))?;
                }
            }
            let live = self.live_path();
            if live.exists() {
                fs::rename(live, self.archived_path(1))?;
            }
        } else {
            fs::remove_file(self.live_path()).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
        }

        self.reopen()
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` handing out guards onto one shared `RotatingLog`.
#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingLog>>,
}

impl SharedLogWriter {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let log = RotatingLog::open(dir, app_name, KEEP_ROTATED, ROTATE_AT_BYTES)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(log)),
        })
    }
}

struct LogWriterGuard {
    inner: Arc<Mutex<RotatingLog>>,
}

impl LogWriterGuard {
    fn with_log<T>(&self, f: impl FnOnce(&mut RotatingLog) -> io::Result<T>) -> io::Result<T> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut log)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = LogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for LogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_log(|log| log.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_log(|log| log.flush())
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
