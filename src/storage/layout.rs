//! Session directory layout and file naming.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Extension used for every stack written by the crate.
pub const STACK_EXTENSION: &str = "tif";

/// Where one session's stacks go and what they are called.
///
/// - burst windows: `burst_{index:03}.tif`
/// - fixed-interval batches: `{stem}_batch_{millis:013}.tif`
/// - merged batches: `{stem}.tif`, then `{stem}_E1.tif`, `{stem}_E2.tif`, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    dir: PathBuf,
    stem: String,
}

impl OutputLayout {
    /// Layout rooted at `dir` with the given file stem.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// `base/experiment/subject_HHMMSS_DDMMYY`, stem `subject`.
    pub fn for_session(base: &Path, experiment: &str, subject: &str, now: DateTime<Local>) -> Self {
        let folder = format!("{}_{}", subject, now.format("%H%M%S_%d%m%y"));
        Self::new(base.join(experiment).join(folder), subject)
    }

    /// Session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem for batch and merged files.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Path of burst window `index` (1-based).
    pub fn burst_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("burst_{:03}.{}", index, STACK_EXTENSION))
    }

    /// Path of a fixed-interval batch stamped with `millis` since the Unix epoch.
    pub fn batch_path(&self, millis: i64) -> PathBuf {
        self.dir.join(format!(
            "{}_batch_{:013}.{}",
            self.stem, millis, STACK_EXTENSION
        ))
    }

    /// Recover the timestamp embedded in a batch file name, if `name` is one
    /// of this stem's batches.
    pub fn batch_stamp(&self, name: &str) -> Option<i64> {
        name.strip_prefix(self.stem.as_str())?
            .strip_prefix("_batch_")?
            .strip_suffix(STACK_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    /// First merged-output name that does not exist yet.
    pub fn unique_merged_path(&self) -> PathBuf {
        let first = self
            .dir
            .join(format!("{}.{}", self.stem, STACK_EXTENSION));
        if !first.exists() {
            return first;
        }
        (1u32..)
            .map(|i| {
                self.dir
                    .join(format!("{}_E{}.{}", self.stem, i, STACK_EXTENSION))
            })
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }
}

/// Strictly increasing batch timestamps, even when two batches close within
/// the same millisecond.
#[derive(Debug, Default)]
pub struct BatchStamper {
    last: Option<i64>,
}

impl BatchStamper {
    /// Next stamp: wall-clock milliseconds, bumped past the previous stamp.
    pub fn next(&mut self, now: DateTime<Local>) -> i64 {
        let mut stamp = now.timestamp_millis();
        if let Some(last) = self.last {
            stamp = stamp.max(last + 1);
        }
        self.last = Some(stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn names_follow_conventions() {
        let layout = OutputLayout::new("/data/session", "mouse1");
        assert_eq!(
            layout.burst_path(7),
            PathBuf::from("/data/session/burst_007.tif")
        );
        assert_eq!(
            layout.batch_path(1_700_000_000_123),
            PathBuf::from("/data/session/mouse1_batch_1700000000123.tif")
        );
        assert_eq!(
            layout.batch_stamp("mouse1_batch_1700000000123.tif"),
            Some(1_700_000_000_123)
        );
        assert_eq!(layout.batch_stamp("mouse2_batch_1700000000123.tif"), None);
        assert_eq!(layout.batch_stamp("mouse1.tif"), None);
    }

    #[test]
    fn session_folder_embeds_time() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let layout = OutputLayout::for_session(Path::new("data"), "gcamp", "m12", now);
        assert_eq!(layout.dir(), Path::new("data/gcamp/m12_140507_090324"));
        assert_eq!(layout.stem(), "m12");
    }

    #[test]
    fn merged_name_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path(), "m1");
        let first = layout.unique_merged_path();
        assert_eq!(first, tmp.path().join("m1.tif"));
        std::fs::write(&first, b"x").unwrap();
        assert_eq!(layout.unique_merged_path(), tmp.path().join("m1_E1.tif"));
        std::fs::write(tmp.path().join("m1_E1.tif"), b"x").unwrap();
        assert_eq!(layout.unique_merged_path(), tmp.path().join("m1_E2.tif"));
    }

    #[test]
    fn stamps_strictly_increase() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let mut stamper = BatchStamper::default();
        let a = stamper.next(now);
        let b = stamper.next(now);
        assert_eq!(b, a + 1);
    }
}
