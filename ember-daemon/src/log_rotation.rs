//! The daemon's log files: where tracing output goes and size-based
//! rotation.
//!
//! `daemon.log` becomes `daemon.log.1`, `.1` becomes `.2`, and so on; the
//! copy that would fall past `max_files` is deleted.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::paths::{stderr_log_path, stdout_log_path};

/// Tracing writer for a log directory: warnings and errors go to
/// `daemon-err.log`, everything else to `daemon.log`. Each event reopens
/// its file in append mode, so output follows the live file across
/// rotations.
#[derive(Debug, Clone)]
pub struct DaemonLogFiles {
    log_dir: PathBuf,
}

impl DaemonLogFiles {
    pub fn create(log_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn open(&self, path: PathBuf) -> LogFileWriter {
        LogFileWriter(OpenOptions::new().create(true).append(true).open(path).ok())
    }
}

impl<'a> MakeWriter<'a> for DaemonLogFiles {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.open(stdout_log_path(&self.log_dir))
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        if *meta.level() <= Level::WARN {
            self.open(stderr_log_path(&self.log_dir))
        } else {
            self.open(stdout_log_path(&self.log_dir))
        }
    }
}

/// One event's handle on a log file. Output is dropped when the file could
/// not be opened.
#[derive(Debug)]
pub struct LogFileWriter(Option<fs::File>);

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB per file, 5 rotated copies.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log_path` when it has reached `max_bytes`. A missing file is
    /// not an error. Returns whether a rotation happened.
    pub fn rotate(&self, log_path: &Path) -> io::Result<bool> {
        let len = match fs::metadata(log_path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if len < self.max_bytes || self.max_files == 0 {
            return Ok(false);
        }

        remove_if_present(&backup_path(log_path, self.max_files))?;
        for n in (1..self.max_files).rev() {
            let from = backup_path(log_path, n);
            if from.exists() {
                fs::rename(&from, backup_path(log_path, n + 1))?;
            }
        }
        fs::rename(log_path, backup_path(log_path, 1))?;
        fs::File::create(log_path)?;
        Ok(true)
    }
}

/// Rotate the daemon's stdout and stderr logs in `log_dir`. Failures are
/// logged per file. Returns the files that were rotated.
pub fn rotate_logs(log_dir: &Path) -> Vec<PathBuf> {
    let policy = RotationPolicy::default();
    let mut rotated = Vec::new();
    for log_path in [stdout_log_path(log_dir), stderr_log_path(log_dir)] {
        match policy.rotate(&log_path) {
            Ok(true) => {
                tracing::info!(path = %log_path.display(), "rotated daemon log");
                rotated.push(log_path);
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed"),
        }
    }
    rotated
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn backup_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    base.with_file_name(name)
}
