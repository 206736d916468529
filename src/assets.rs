//! Synthesis output lookup and reply logging
//!
//! Some synthesis backends write into a directory without reporting the
//! file they produced. [`AssetStore`] picks the most recently modified
//! matching file. This is racy when two syntheses overlap; only
//! modification order is trusted, never file names.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::Result;

/// A directory of generated audio assets
#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
    extension: String,
}

impl AssetStore {
    /// Watch `dir` for files with `extension` (without the dot)
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    /// The watched directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Most recently modified matching file
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be listed
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !self.matches(&path) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().is_none_or(|(t, _)| modified >= *t) {
                newest = Some((modified, path));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }

    fn matches(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

/// Numbered text files holding each reply (`generated1.txt`, ...)
#[derive(Debug)]
pub struct ReplyLog {
    dir: PathBuf,
    prefix: String,
}

impl ReplyLog {
    /// Prepare `dir`, removing replies from a previous run
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or cleaned
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let log = Self {
            dir: dir.into(),
            prefix: "generated".to_string(),
        };

        std::fs::create_dir_all(&log.dir)?;
        for path in log.existing()? {
            std::fs::remove_file(&path)?;
        }

        tracing::debug!(dir = %log.dir.display(), "reply log ready");
        Ok(log)
    }

    /// Write `reply` to the next numbered file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn record(&self, reply: &str) -> Result<PathBuf> {
        let next = self.existing()?.len() + 1;
        let path = self.dir.join(format!("{}{next}.txt", self.prefix));
        std::fs::write(&path, reply)?;
        tracing::debug!(path = %path.display(), "reply saved");
        Ok(path)
    }

    fn existing(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_reply = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&self.prefix) && n.ends_with(".txt"));
            if is_reply {
                found.push(path);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_latest_by_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path(), "wav");
        assert!(store.latest().unwrap().is_none());

        // Name order deliberately disagrees with modification order
        std::fs::write(dir.path().join("z_first.wav"), b"a").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.path().join("a_second.wav"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"c").unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "a_second.wav");
    }

    #[test]
    fn test_missing_dir_has_no_latest() {
        let store = AssetStore::new("/nonexistent/echoloop-output", ".wav");
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_reply_log_numbering_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("generated7.txt"), "old").unwrap();
        std::fs::write(dir.path().join("keep.md"), "mine").unwrap();

        let log = ReplyLog::open(dir.path()).unwrap();
        assert!(!dir.path().join("generated7.txt").exists());
        assert!(dir.path().join("keep.md").exists());

        let first = log.record("hello").unwrap();
        let second = log.record("again").unwrap();
        assert_eq!(first.file_name().unwrap(), "generated1.txt");
        assert_eq!(second.file_name().unwrap(), "generated2.txt");
        assert_eq!(std::fs::read_to_string(second).unwrap(), "again");
    }
}
