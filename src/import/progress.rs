use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Start,
    Info,
    Warning,
    Error,
    Finish,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgressStatus::Start => "start",
            ProgressStatus::Info => "info",
            ProgressStatus::Warning => "warning",
            ProgressStatus::Error => "error",
            ProgressStatus::Finish => "finish",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: String,
    pub status: ProgressStatus,
    pub message: String,
}

/// Progress of one run, mirrored to tracing and, when a path is set, to an
/// append-only JSON-lines file that survives a restart of the host.
#[derive(Debug)]
pub struct ProgressLog {
    entries: Vec<ProgressEntry>,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl ProgressLog {
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            path: None,
            file: None,
        }
    }

    pub fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::in_memory());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            entries: Vec::new(),
            path: Some(path.to_path_buf()),
            file: Some(file),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&mut self, status: ProgressStatus, message: impl Into<String>) -> &ProgressEntry {
        let entry = ProgressEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status,
            message: message.into(),
        };

        match status {
            ProgressStatus::Warning => {
                tracing::warn!(
                    target: "siteport",
                    event = "import_progress",
                    status = %status,
                    message = %entry.message,
                )
            }
            ProgressStatus::Error => {
                tracing::error!(
                    target: "siteport",
                    event = "import_progress",
                    status = %status,
                    message = %entry.message,
                )
            }
            _ => {
                tracing::info!(
                    target: "siteport",
                    event = "import_progress",
                    status = %status,
                    message = %entry.message,
                )
            }
        }

        if let Some(file) = self.file.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(file, "{line}"));
            if let Err(err) = written {
                tracing::warn!(
                    target: "siteport",
                    event = "progress_log_write_failed",
                    path = ?self.path,
                    error = %err,
                );
                // Keep logging in memory; the file is no longer trustworthy.
                self.file = None;
            }
        }

        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[ProgressEntry] {
        &self.entries
    }

    pub fn messages_with(&self, status: ProgressStatus) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |entry| entry.status == status)
            .map(|entry| entry.message.as_str())
    }

    pub fn has_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.status, ProgressStatus::Warning | ProgressStatus::Error))
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    /// Replays a persisted log. Lines that do not parse are skipped.
    pub fn load(path: &Path) -> std::io::Result<Vec<ProgressEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::debug!(
                    target: "siteport",
                    event = "progress_line_skipped",
                    error = %err,
                ),
            }
        }
        Ok(entries)
    }
}
