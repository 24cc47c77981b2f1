use super::{BusError, BusHead, DataBus};
use crate::record::SignalRecord;
use crate::types::Version;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

const LATEST_FILE: &str = "latest.json";
const TMP_FILE: &str = "latest.json.tmp";
const HISTORY_DIR: &str = "history";

/// Directory-backed bus.
///
/// `latest.json` holds two lines: a compact [`BusHead`] followed by the full
/// record. Publishing writes `latest.json.tmp`, syncs it, copies it into
/// `history/` and renames it over `latest.json`, so readers see either the old
/// or the new entry. The head line lets [`DataBus::peek_head`] answer without
/// touching the payload.
pub struct FileBus {
    dir: PathBuf,
    history_depth: usize,
    write_lock: Mutex<()>,
}

impl FileBus {
    /// Open (creating if needed) a bus directory and verify it is writable.
    pub fn open(dir: impl Into<PathBuf>, history_depth: usize) -> Result<Self, BusError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(HISTORY_DIR)).map_err(|err| BusError::Unusable {
            path: dir.clone(),
            details: err.to_string(),
        })?;

        let probe = dir.join(".probe");
        File::create(&probe)
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|err| BusError::Unusable {
                path: dir.clone(),
                details: format!("not writable: {err}"),
            })?;

        Ok(Self {
            dir,
            history_depth,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    fn history_path(&self, version: Version) -> PathBuf {
        self.dir
            .join(HISTORY_DIR)
            .join(format!("{:020}.json", version.0))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<SignalRecord>, BusError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BusError::io(path, err)),
        };
        let (head_line, body) = contents.split_once('\n').ok_or_else(|| BusError::Decode {
            path: path.to_path_buf(),
            details: "missing record body".into(),
        })?;
        let head: BusHead = decode(path, head_line)?;
        let record: SignalRecord = decode(path, body.trim_end())?;
        if record.version != head.version {
            return Err(BusError::Decode {
                path: path.to_path_buf(),
                details: format!("head says {} but body holds {}", head.version, record.version),
            });
        }
        Ok(Some(record))
    }

    fn write_tmp(&self, record: &SignalRecord) -> Result<PathBuf, BusError> {
        let tmp = self.dir.join(TMP_FILE);
        let head = serde_json::to_string(&BusHead::of(record)).map_err(|err| encode_err(&tmp, err))?;
        let body = serde_json::to_string(record).map_err(|err| encode_err(&tmp, err))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|err| BusError::io(&tmp, err))?;
        write_lines(&mut file, &[&head, &body]).map_err(|err| BusError::io(&tmp, err))?;
        Ok(tmp)
    }

    fn archive(&self, tmp: &Path, version: Version) -> Result<(), BusError> {
        let target = self.history_path(version);
        fs::copy(tmp, &target).map_err(|err| BusError::io(&target, err))?;
        Ok(())
    }

    /// Archived versions, ascending.
    fn archived_versions(&self) -> Result<Vec<u64>, BusError> {
        let history = self.dir.join(HISTORY_DIR);
        let entries = fs::read_dir(&history).map_err(|err| BusError::io(&history, err))?;
        let mut versions: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u64>().ok())
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// The current entry's copy plus `history_depth` superseded ones are kept.
    fn prune_history(&self) -> Result<(), BusError> {
        let versions = self.archived_versions()?;
        let excess = versions.len().saturating_sub(self.history_depth + 1);
        for version in versions.into_iter().take(excess) {
            let path = self.history_path(Version(version));
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to prune bus history");
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_dir(&self) {
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) {}
}

impl DataBus for FileBus {
    fn publish(&self, record: &SignalRecord) -> Result<(), BusError> {
        let _guard = self.write_lock.lock();

        let current = match self.peek_head() {
            Ok(head) => head.map(|head| head.version),
            Err(err @ BusError::Decode { .. }) => {
                tracing::warn!(error = %err, "overwriting unreadable bus entry");
                None
            }
            Err(err) => return Err(err),
        };
        if let Some(current) = current {
            if record.version <= current {
                return Err(BusError::StaleVersion {
                    attempted: record.version,
                    current,
                });
            }
        }

        let tmp = self.write_tmp(record)?;
        self.archive(&tmp, record.version)?;
        let latest = self.latest_path();
        fs::rename(&tmp, &latest).map_err(|err| BusError::io(&latest, err))?;
        self.sync_dir();

        if let Err(err) = self.prune_history() {
            tracing::warn!(error = %err, "bus history pruning failed");
        }
        tracing::debug!(version = %record.version, rows = record.payload.len(), "bus entry replaced");
        Ok(())
    }

    fn read_latest(&self) -> Result<Option<SignalRecord>, BusError> {
        self.read_entry(&self.latest_path())
    }

    fn peek_head(&self) -> Result<Option<BusHead>, BusError> {
        let path = self.latest_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BusError::io(&path, err)),
        };
        let mut line = String::new();
        BufReader::new(file)
            .read_line(&mut line)
            .map_err(|err| BusError::io(&path, err))?;
        decode(&path, line.trim_end()).map(Some)
    }

    fn read_version(&self, version: Version) -> Result<Option<SignalRecord>, BusError> {
        if self.peek_version()? == Some(version) {
            return self.read_latest();
        }
        self.read_entry(&self.history_path(version))
    }

    fn last_archived_version(&self) -> Result<Option<Version>, BusError> {
        Ok(self.archived_versions()?.last().copied().map(Version))
    }
}

fn write_lines(file: &mut File, lines: &[&str]) -> std::io::Result<()> {
    for line in lines {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

fn decode<T: serde::de::DeserializeOwned>(path: &Path, text: &str) -> Result<T, BusError> {
    serde_json::from_str(text).map_err(|err| BusError::Decode {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn encode_err(path: &Path, err: serde_json::Error) -> BusError {
    BusError::Decode {
        path: path.to_path_buf(),
        details: format!("encode failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TargetRow;
    use chrono::Utc;

    fn record(version: u64, rows: &[(&str, f64)]) -> SignalRecord {
        SignalRecord::new(
            Version(version),
            Utc::now(),
            rows.iter().map(|(id, w)| TargetRow::new(*id, *w)).collect(),
        )
    }

    #[test]
    fn absent_bus_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 3).unwrap();
        assert!(bus.read_latest().unwrap().is_none());
        assert!(bus.peek_version().unwrap().is_none());
    }

    #[test]
    fn publish_then_peek_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 3).unwrap();
        let rec = record(1, &[("AAA", 0.6), ("BBB", 0.4)]);
        bus.publish(&rec).unwrap();

        let head = bus.peek_head().unwrap().unwrap();
        assert_eq!(head.version, Version(1));
        assert_eq!(head.rows, 2);
        assert_eq!(bus.read_latest().unwrap(), Some(rec));
        assert!(!dir.path().join(TMP_FILE).exists());
    }

    #[test]
    fn rejects_non_increasing_versions() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 3).unwrap();
        bus.publish(&record(5, &[("AAA", 1.0)])).unwrap();
        let err = bus.publish(&record(5, &[("BBB", 1.0)])).unwrap_err();
        assert!(matches!(err, BusError::StaleVersion { .. }));
        let err = bus.publish(&record(4, &[("BBB", 1.0)])).unwrap_err();
        assert!(matches!(err, BusError::StaleVersion { .. }));
        assert_eq!(bus.peek_version().unwrap(), Some(Version(5)));
    }

    #[test]
    fn keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 2).unwrap();
        for v in 1..=5 {
            bus.publish(&record(v, &[("AAA", v as f64)])).unwrap();
        }
        assert!(bus.read_version(Version(1)).unwrap().is_none());
        assert!(bus.read_version(Version(2)).unwrap().is_none());
        assert_eq!(bus.read_version(Version(3)).unwrap().unwrap().version, Version(3));
        assert_eq!(bus.read_version(Version(4)).unwrap().unwrap().version, Version(4));
        assert_eq!(bus.read_version(Version(5)).unwrap().unwrap().version, Version(5));
    }

    #[test]
    fn leftover_tmp_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 0).unwrap();
        bus.publish(&record(1, &[("AAA", 1.0)])).unwrap();
        fs::write(dir.path().join(TMP_FILE), b"{\"version\":9").unwrap();

        assert_eq!(bus.peek_version().unwrap(), Some(Version(1)));
        bus.publish(&record(2, &[("AAA", 2.0)])).unwrap();
        assert_eq!(bus.read_latest().unwrap().unwrap().version, Version(2));
    }

    #[test]
    fn garbage_entry_is_a_transient_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 0).unwrap();
        fs::write(dir.path().join(LATEST_FILE), b"not json\n").unwrap();
        let err = bus.peek_head().unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn torn_head_is_overwritten_and_history_keeps_the_last_version() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::open(dir.path(), 1).unwrap();
        bus.publish(&record(1, &[("AAA", 1.0)])).unwrap();
        bus.publish(&record(2, &[("AAA", 2.0)])).unwrap();
        fs::write(dir.path().join(LATEST_FILE), b"{\"version\":\n").unwrap();

        assert!(bus.peek_version().is_err());
        assert_eq!(bus.last_archived_version().unwrap(), Some(Version(2)));
        bus.publish(&record(3, &[("AAA", 3.0)])).unwrap();
        assert_eq!(bus.peek_version().unwrap(), Some(Version(3)));
        assert_eq!(bus.last_archived_version().unwrap(), Some(Version(3)));
    }
}
