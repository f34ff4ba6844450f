//! Logging setup for the Arcamatrix agent.
//!
//! Writes to stderr and to a size-rotated log file under the agent home
//! directory. The file keeps full detail; the console follows `RUST_LOG`.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "arca_agent=info,arca_store=info,arca_sprites=info";
const MAX_LOG_FILES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(app_name: &str) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RotatingWriter::open(log_dir, app_name)
        .context("Failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Agent home directory: ~/.arcamatrix (override with ARCAMATRIX_HOME).
pub fn arcamatrix_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("ARCAMATRIX_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".arcamatrix")
}

/// Logs directory: ~/.arcamatrix/logs
pub fn logs_dir() -> PathBuf {
    arcamatrix_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Appender that rotates `<name>.log` -> `<name>.log.1` -> ... once the
/// active file exceeds [`MAX_LOG_FILE_SIZE`].
struct RotatingAppender {
    dir: PathBuf,
    base_name: String,
    file: File,
    current_size: u64,
}

impl RotatingAppender {
    fn open(dir: PathBuf, base_name: String) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{base_name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            dir,
            base_name,
            file,
            current_size,
        })
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.rotated_path(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = self.rotated_path(idx);
            if src.exists() {
                fs::rename(&src, self.rotated_path(idx + 1))?;
            }
        }
        let active = self.active_path();
        if active.exists() {
            fs::rename(&active, self.rotated_path(1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Clone-able handle handed to tracing; serializes writes through a mutex.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<RotatingAppender>>,
}

impl RotatingWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<Self> {
        let appender = RotatingAppender::open(dir, sanitize_name(base_name))
            .with_context(|| format!("Failed to open log file for {base_name}"))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

struct RotatingWriterGuard {
    inner: Arc<Mutex<RotatingAppender>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RotatingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_app_names() {
        assert_eq!(sanitize_name("arca-agent"), "arca-agent");
        assert_eq!(sanitize_name("arca agent/1"), "arca_agent_1");
    }

    #[test]
    fn rotation_keeps_bounded_file_set() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut appender =
            RotatingAppender::open(dir.path().to_path_buf(), "agent".into()).unwrap();

        for _ in 0..4 {
            appender.current_size = MAX_LOG_FILE_SIZE;
            appender.write_all(b"line\n").unwrap();
        }

        assert!(dir.path().join("agent.log").exists());
        assert!(dir.path().join("agent.log.1").exists());
        assert!(dir.path().join("agent.log.2").exists());
        assert!(!dir.path().join("agent.log.3").exists());
    }
}
