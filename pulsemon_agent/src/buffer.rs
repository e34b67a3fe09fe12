//! Bounded on-disk queue of snapshots awaiting delivery: newline-delimited
//! JSON, one snapshot per line, oldest entries evicted past capacity.
//!
//! Reads are tolerant (blank and malformed lines are skipped); writes stage
//! the full contents to a sibling temp file, fsync, then rename over the
//! target, so a crash leaves either the old or the fully-new file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::types::Snapshot;

const DEFAULT_MAX_SIZE: usize = 10;

pub struct Buffer {
    path: PathBuf,
    max_size: usize,
}

impl Buffer {
    pub fn new(path: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            path: path.into(),
            max_size: if max_size == 0 {
                DEFAULT_MAX_SIZE
            } else {
                max_size
            },
        }
    }

    /// Append one snapshot, keeping only the newest `max_size` entries.
    pub fn push(&self, snapshot: &Snapshot) -> io::Result<()> {
        let mut items = self.pending()?;
        items.push(snapshot.clone());
        if items.len() > self.max_size {
            let excess = items.len() - self.max_size;
            items.drain(..excess);
        }
        self.write_all(&items)
    }

    /// All persisted snapshots in insertion order. Does not modify the file;
    /// a missing file is an empty queue, not an error.
    pub fn pending(&self) -> io::Result<Vec<Snapshot>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn count(&self) -> io::Result<usize> {
        Ok(self.pending()?.len())
    }

    /// Truncate the queue. Idempotent, safe when the file does not exist.
    pub fn clear(&self) -> io::Result<()> {
        self.write_all(&[])
    }

    fn write_all(&self, items: &[Snapshot]) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let mut staged = String::new();
        for item in items {
            staged.push_str(&serde_json::to_string(item).map_err(io::Error::other)?);
            staged.push('\n');
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(staged.as_bytes())?;
            file.sync_all()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
            }
            fs::rename(&tmp, &self.path)?;
            if let Ok(parent) = File::open(dir) {
                let _ = parent.sync_all();
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_snapshot;

    fn queue(dir: &tempfile::TempDir, max_size: usize) -> Buffer {
        Buffer::new(dir.path().join("buffer.jsonl"), max_size)
    }

    #[test]
    fn push_then_pending_returns_the_appended_item_last() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 10);

        buffer.push(&test_snapshot("first")).unwrap();
        buffer.push(&test_snapshot("second")).unwrap();

        let items = buffer.pending().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].hostname, "first");
        assert_eq!(items[1].hostname, "second");
        assert_eq!(buffer.count().unwrap(), 2);
    }

    #[test]
    fn eviction_keeps_the_newest_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 10);

        for i in 1..=13 {
            buffer.push(&test_snapshot(&format!("s{i}"))).unwrap();
        }

        let items = buffer.pending().unwrap();
        assert_eq!(items.len(), 10);
        assert_eq!(items[0].hostname, "s4");
        assert_eq!(items[9].hostname, "s13");
    }

    #[test]
    fn zero_capacity_falls_back_to_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 0);

        for i in 0..12 {
            buffer.push(&test_snapshot(&format!("s{i}"))).unwrap();
        }
        assert_eq!(buffer.count().unwrap(), 10);
    }

    #[test]
    fn clear_is_idempotent_and_safe_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 10);

        buffer.clear().unwrap();
        assert_eq!(buffer.count().unwrap(), 0);

        buffer.push(&test_snapshot("x")).unwrap();
        buffer.clear().unwrap();
        buffer.clear().unwrap();
        assert_eq!(buffer.count().unwrap(), 0);
    }

    #[test]
    fn pending_on_a_missing_file_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 10);
        assert!(buffer.pending().unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let good_a = serde_json::to_string(&test_snapshot("a")).unwrap();
        let good_b = serde_json::to_string(&test_snapshot("b")).unwrap();
        fs::write(&path, format!("{good_a}\n{{not json}}\n\n{good_b}\n")).unwrap();

        let buffer = Buffer::new(&path, 10);
        let items = buffer.pending().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].hostname, "a");
        assert_eq!(items[1].hostname, "b");
    }

    #[test]
    fn push_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new(dir.path().join("nested/state/buffer.jsonl"), 10);
        buffer.push(&test_snapshot("deep")).unwrap();
        assert_eq!(buffer.count().unwrap(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn queue_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let buffer = queue(&dir, 10);
        buffer.push(&test_snapshot("secret")).unwrap();

        let mode = fs::metadata(dir.path().join("buffer.jsonl"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
