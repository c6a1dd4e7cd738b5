pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};

use config::LoggingSettings;

const LOG_FILE_NAME: &str = "mcp-dispatch.log";

/// Return the platform-standard data directory for mcp-dispatch.
///
/// - macOS: `~/Library/Application Support/mcp-dispatch/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-dispatch\`
/// - Linux: `$XDG_DATA_HOME/mcp-dispatch/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-dispatch/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-dispatch");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-dispatch")
}

/// Initialize the tracing subscriber.
///
/// Rotates the previous logs, then writes to a fresh `mcp-dispatch.log`
/// through a line-flushing writer. If the log directory or file cannot be
/// created, logs go to stderr instead. `RUST_LOG` overrides the configured
/// filter.
///
/// Returns the log file path, or `None` when logging to stderr.
pub fn init_tracing(settings: &LoggingSettings) -> Option<PathBuf> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new("mcp_dispatch=info,warn"));

    let log_dir = settings.log_dir.clone().unwrap_or_else(data_dir);
    let log_path = log_dir.join(LOG_FILE_NAME);

    let log_file = std::fs::create_dir_all(&log_dir).and_then(|_| {
        rotate_log_file(&log_path, settings.keep_rotated);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let log_path = match log_file {
        Ok(file) => {
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            let installed = if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.is_ok().then_some(log_path)
        }
        Err(e) => {
            eprintln!("mcp-dispatch: cannot open {}: {e}; logging to stderr", log_path.display());
            let builder = builder.with_writer(std::io::stderr);
            let _ = if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            None
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-dispatch starting ==="
    );
    log_path
}

/// Rotate log files: `mcp-dispatch.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so a
/// crash never loses the last log lines.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
