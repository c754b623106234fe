//! Audit trail for privileged API actions
//!
//! One line per action, appended to a plain text file. Writes are
//! best-effort; a failing audit write is logged but never blocks the
//! action itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

pub struct AuditLog {
    file: Mutex<Option<File>>,
}

impl AuditLog {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    /// A disabled audit log that drops every record.
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Record one privileged action.
    pub fn record(&self, user_id: &str, command: &str, detail: &str) {
        let line = format!(
            "{} user={} command={} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            user_id,
            command,
            detail
        );
        let mut guard = self.file.lock().expect("audit lock poisoned");
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                warn!(error = %e, "Failed to write audit record");
            }
        }
    }
}
