//! Decision telemetry.
//!
//! Every gate rejection and relay outcome is recorded as a
//! newline-delimited JSON line through a size-rotating file writer.  The
//! record carries the specific server-side reason; clients only ever see
//! the generic error category.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Simple size-based rotating writer (single backup file `<path>.1` kept,
/// optionally gzip-compressed).
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(RotatingWriter {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotate();
        writeln!(self.file, "{}", line)
    }

    fn check_rotate(&mut self) {
        if let Some(limit) = self.max_bytes {
            let exceeded = self
                .path
                .metadata()
                .map(|meta| meta.len() >= limit)
                .unwrap_or(false);
            if exceeded {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current();
            }
        }
    }

    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("{}", idx - 1))
            };
            if old.exists() {
                let new = self.path.with_extension(format!("{}", idx));
                let _ = fs::rename(&old, &new);
            }
        }
    }

    fn compress_latest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let gz_path = rotated.with_extension("1.gz");
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(&gz_path, buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }
}

/// Sink for decision records.  Writes NDJSON when a log file is
/// configured and mirrors a compact line to `tracing` either way.
#[derive(Clone)]
pub struct DecisionLog {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl DecisionLog {
    pub fn new(writer: Option<Arc<Mutex<RotatingWriter>>>) -> Self {
        DecisionLog {
            writer,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        DecisionLog::new(None)
    }

    pub fn emit(&self, record: &serde_json::Value) {
        if let Some(writer) = &self.writer {
            let line = record.to_string();
            if let Ok(mut guard) = writer.lock() {
                match guard.write_line(&line) {
                    Ok(()) => {
                        self.lines_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to write decision record");
                        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        tracing::debug!(target: "decisions", record = %record, "decision");
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}
