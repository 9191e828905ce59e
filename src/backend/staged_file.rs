use crate::util::close::Close;
use crate::util::encoding::FILE_SAFE_ENCODING;
use fs2::FileExt;
use rand::{CryptoRng, RngCore};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::{fs, io};
use tracing::warn;

const SUFFIX_BYTES: usize = 4;
const SUFFIX_ENCODED_LEN: usize = 7;

/// A file written under a temporary name next to its target and moved into place on
/// [Close::close].
///
/// Dropping a staged file without closing it discards what was written, so readers never see a
/// partially written target.
pub struct StagedFile<P: AsRef<Path>> {
    file: File,
    tmp_path: PathBuf,
    target_path: P,
    done: bool,
}

impl<P: AsRef<Path>> StagedFile<P> {
    pub fn new<R: CryptoRng + RngCore>(target_path: P, rng: &mut R) -> io::Result<Self> {
        let mut bytes = [0; SUFFIX_BYTES];
        rng.fill_bytes(&mut bytes);
        Self::new_with_suffix(target_path, &FILE_SAFE_ENCODING.encode(&bytes))
    }

    fn new_with_suffix(target_path: P, suffix: &str) -> io::Result<Self> {
        let file_name = target_path
            .as_ref()
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid file name"))?;
        let tmp_path = target_path
            .as_ref()
            .with_file_name(format!("{file_name}.tmp.{suffix}"));
        for _ in 0..5 {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?;
            file.lock_exclusive()?;
            if !tmp_path.exists() {
                // Removed by a concurrent clean_leftover_tmp_files before the lock was taken.
                continue;
            }
            return Ok(Self {
                file,
                tmp_path,
                target_path,
                done: false,
            });
        }
        Err(io::Error::other("failed to create and lock a staging file"))
    }
}

impl<P: AsRef<Path>> Write for StagedFile<P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<P: AsRef<Path>> Close for StagedFile<P> {
    fn close(mut self) -> io::Result<()> {
        self.done = true;
        self.file.sync_data()?;
        fs::rename(&self.tmp_path, self.target_path.as_ref())
    }
}

impl<P: AsRef<Path>> Drop for StagedFile<P> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = fs::remove_file(&self.tmp_path) {
                warn!(path = %self.tmp_path.display(), error = %err, "cannot discard staging file");
            }
        }
    }
}

/// Removes staging files left behind by writers that were killed, in `path` and all its
/// subdirectories. Staging files still locked by a live writer are kept.
pub fn clean_leftover_tmp_files(path: impl AsRef<Path>) -> io::Result<()> {
    for entry in path.as_ref().read_dir()? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            clean_leftover_tmp_files(entry.path())?;
            continue;
        }
        let is_staging_file = entry.file_name().to_str().is_some_and(|name| {
            let mut parts = name.rsplitn(3, '.');
            let suffix = parts.next();
            parts.next() == Some("tmp") && suffix.map(str::len) == Some(SUFFIX_ENCODED_LEN)
        });
        if is_staging_file {
            let abandoned = File::open(entry.path())
                .and_then(|file| file.try_lock_exclusive())
                .is_ok();
            if abandoned {
                fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    #[test]
    fn test_suffix_length_matches_encoding() {
        assert_eq!(
            SUFFIX_ENCODED_LEN,
            FILE_SAFE_ENCODING.encode(&[0; SUFFIX_BYTES]).len()
        );
    }

    #[test]
    fn test_target_appears_on_close() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("artifact");
        let mut file = StagedFile::new(&path, &mut StdRng::seed_from_u64(0)).unwrap();
        file.write_all(b"payload").unwrap();
        assert!(!path.exists());
        file.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_drop_without_close_discards() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("artifact");
        fs::write(&path, b"old").unwrap();
        {
            let mut file = StagedFile::new(&path, &mut StdRng::seed_from_u64(0)).unwrap();
            file.write_all(b"half").unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert_eq!(tempdir.path().read_dir().unwrap().count(), 1);
    }

    #[test]
    fn test_fails_if_staging_file_exists() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("artifact");
        let _file = StagedFile::new_with_suffix(&path, "abcdefg").unwrap();
        assert!(StagedFile::new_with_suffix(&path, "abcdefg").is_err());
    }

    #[test]
    fn test_clean_removes_abandoned_staging_files() {
        let tempdir = tempdir().unwrap();
        let subdir = tempdir.path().join("tag").join("Text");
        fs::create_dir_all(&subdir).unwrap();
        let leftover = subdir.join(format!(
            "x.tmp.{}",
            FILE_SAFE_ENCODING.encode(&[0; SUFFIX_BYTES])
        ));
        File::create(&leftover).unwrap();
        let unrelated = subdir.join("x.meta");
        File::create(&unrelated).unwrap();
        clean_leftover_tmp_files(tempdir.path()).unwrap();
        assert!(!leftover.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_clean_keeps_staging_files_in_use() {
        let tempdir = tempdir().unwrap();
        let target = tempdir.path().join("artifact");
        let file = StagedFile::new(&target, &mut StdRng::seed_from_u64(0)).unwrap();
        clean_leftover_tmp_files(tempdir.path()).unwrap();
        file.close().unwrap();
        assert!(target.exists());
    }
}
