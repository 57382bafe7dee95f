pub mod agent_core;
pub mod commands;
pub mod config;
pub mod inference;
pub mod tools;
pub mod transcription;
pub mod vault;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for Knap.
///
/// - macOS: `~/Library/Application Support/knap/`
/// - Windows: `{FOLDERID_RoamingAppData}\knap\`
/// - Linux: `$XDG_DATA_HOME/knap/` (fallback `~/.local/share/knap/`)
///
/// Falls back to `~/.knap/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("knap");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".knap")
}

/// Initialize the tracing subscriber — writes structured logs to the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (knap.log → knap.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh knap.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the data directory path for discoverability.
///
/// Returns the log file path. Logs never go to stdout, which belongs to the REPL.
pub fn init_tracing() -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("knap.log");

    // Rotate: knap.log.2 → .3, .1 → .2, knap.log → .1
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knap=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    // Startup banner — makes it easy to find the right log file
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Knap starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `knap.log` → `knap.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers output internally; without explicit flushing
/// the last lines before a crash can be lost.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_keeps_last_three() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("knap.log");
        for generation in 0..5 {
            std::fs::write(&base, format!("gen {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }
        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(format!("{}.{n}", base.display())).unwrap();
        assert_eq!(read(1), "gen 4");
        assert_eq!(read(2), "gen 3");
        assert_eq!(read(3), "gen 2");
        assert!(!dir.path().join("knap.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_log_lines_are_plain_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knap.log");
        let writer = FlushingWriter::new(std::fs::File::create(&path).unwrap());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(notes = 3, "vault index built");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("INFO"));
        assert!(text.contains("vault index built notes=3"));
        assert!(!text.trim_start().starts_with('{'));
    }
}
