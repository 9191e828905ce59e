//! Sidecar records that tell whether a stored copy is still fresh.

use crate::backend::staged_file::StagedFile;
use crate::descriptor::Descriptor;
use crate::error::{DepotResult, IoPathError, WithPath};
use crate::util::close::Close;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const META_SUFFIX: &str = ".meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    pub descriptor: Descriptor,
    pub path: PathBuf,
    pub write_time: Option<DateTime<Utc>>,
    pub load_time: Option<DateTime<Utc>>,
    pub max_age_secs: Option<i64>,
}

impl MetaData {
    pub fn new(descriptor: &Descriptor, path: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: descriptor.key(),
            path: path.into(),
            write_time: None,
            load_time: None,
            max_age_secs: descriptor.max_age().map(|age| age.num_seconds()),
        }
    }

    pub fn written_at(mut self, time: DateTime<Utc>) -> Self {
        self.write_time = Some(time);
        self
    }

    /// Location of the sidecar belonging to the artifact stored at `path`.
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut sidecar = OsString::from(path.as_os_str());
        sidecar.push(META_SUFFIX);
        PathBuf::from(sidecar)
    }

    pub fn max_age(&self, default: TimeDelta) -> TimeDelta {
        self.max_age_secs.map(TimeDelta::seconds).unwrap_or(default)
    }

    /// Whether the copy was written or loaded less than its max-age before `now`.
    pub fn is_valid(&self, now: DateTime<Utc>, default_max_age: TimeDelta) -> bool {
        let refreshed = match (self.write_time, self.load_time) {
            (Some(written), Some(loaded)) => written.max(loaded),
            (Some(time), None) | (None, Some(time)) => time,
            (None, None) => return false,
        };
        now - refreshed < self.max_age(default_max_age)
    }

    /// Reads a sidecar. A missing sidecar yields `None`, so does a malformed one.
    pub fn read(sidecar: &Path) -> DepotResult<Option<MetaData>> {
        let bytes = match fs::read(sidecar) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(IoPathError::new(err, sidecar).into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                warn!(path = %sidecar.display(), error = %err, "ignoring malformed metadata");
                Ok(None)
            }
        }
    }

    pub fn write(&self, sidecar: &Path) -> DepotResult<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)
            .with_path(sidecar)?;
        let mut file = StagedFile::new(sidecar, &mut rand::rng()).with_path(sidecar)?;
        file.write_all(&bytes).with_path(sidecar)?;
        file.close().with_path(sidecar)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            MetaData::sidecar_path(Path::new("/store/t/Text/x")),
            PathBuf::from("/store/t/Text/x.meta")
        );
    }

    #[test]
    fn test_validity_window() {
        let meta = MetaData::new(&Descriptor::new("Text", "x"), "x").written_at(at(0));
        assert!(meta.is_valid(at(3599), TimeDelta::hours(1)));
        assert!(!meta.is_valid(at(3600), TimeDelta::hours(1)));
        let never_written = MetaData::new(&Descriptor::new("Text", "x"), "x");
        assert!(!never_written.is_valid(at(0), TimeDelta::days(36500)));
    }

    #[test]
    fn test_descriptor_max_age_overrides_default() {
        let desc = Descriptor::new("Text", "x").with_max_age(TimeDelta::seconds(10));
        let mut meta = MetaData::new(&desc, "x").written_at(at(0));
        assert!(!meta.is_valid(at(10), TimeDelta::hours(1)));
        meta.load_time = Some(at(5));
        assert!(meta.is_valid(at(10), TimeDelta::hours(1)));
    }

    #[test]
    fn test_write_then_read() {
        let tempdir = tempdir().unwrap();
        let sidecar = tempdir.path().join("x.meta");
        let meta = MetaData::new(&Descriptor::new("Text", "x"), tempdir.path().join("x"))
            .written_at(at(42));
        meta.write(&sidecar).unwrap();
        assert_eq!(MetaData::read(&sidecar).unwrap(), Some(meta));
    }

    #[test]
    fn test_missing_or_malformed_sidecar_reads_as_none() {
        let tempdir = tempdir().unwrap();
        let sidecar = tempdir.path().join("x.meta");
        assert_eq!(MetaData::read(&sidecar).unwrap(), None);
        fs::write(&sidecar, b"garbage").unwrap();
        assert_eq!(MetaData::read(&sidecar).unwrap(), None);
    }
}
