use crate::audit::{AuditEvent, AuditSink};
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends one JSON object per event to a file, for the process supervisor
/// to tail.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let line = json!({ "ts": Utc::now(), "audit": event });
        let mut bytes = serde_json::to_vec(&line).context("serialize audit event")?;
        bytes.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&bytes).context("append audit event")?;
        file.flush().context("flush audit file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;

    #[test]
    fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.emit(AuditEvent::Discarded {
            version: Version(1),
            watermark: Some(Version(2)),
        })
        .unwrap();
        sink.emit(AuditEvent::ApplyFailed {
            version: Version(3),
            error: "order gateway down".into(),
        })
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["audit"]["event"], "discarded");
        assert_eq!(lines[1]["audit"]["version"], 3);
    }
}
