//! Keeps artifacts as files in a directory tree.

use super::Backend;
use super::staged_file::{StagedFile, clean_leftover_tmp_files};
use crate::artifact::{ArtifactRef, FileArtifact, KIND_FILE, Value, downcast_ref};
use crate::codec::{CodecError, CodecRegistry, LINK_HEADER};
use crate::descriptor::{Descriptor, TimeRange};
use crate::error::{DepotError, DepotResult, IoPathError, WithPath};
use crate::meta::{META_SUFFIX, MetaData};
use crate::util::clock::{Clock, SystemClock};
use crate::util::close::Close;
use chrono::{DateTime, TimeDelta, Utc};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};
use tracing::{debug, trace, warn};

pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

/// A backend storing each artifact at `{root}/{tag}/{kind}/{id}` with a `.meta` sidecar.
///
/// Writes go to a staging file that is renamed into place, so the canonical path never holds a
/// partial file. Artifacts of kind [KIND_FILE] are copied as they are; everything else is
/// encoded with the [CodecRegistry].
///
/// # Examples
///
/// ```rust
/// # use depot::error::DepotResult;
/// # fn main() -> DepotResult<()> {
/// use std::sync::Arc;
/// use depot::artifact::{Text, Value};
/// use depot::backend::Backend;
/// use depot::backend::local::LocalFileBackend;
/// use depot::codec::CodecRegistry;
/// use depot::descriptor::Descriptor;
///
/// let dir = tempfile::tempdir().unwrap();
/// let backend = LocalFileBackend::new(dir.path(), Arc::new(CodecRegistry::with_defaults()));
/// let desc = Descriptor::new("Text", "motd");
/// backend.put(&desc, Value::Artifact(Arc::new(Text::new("Hello, world!"))))?;
/// assert!(dir.path().join("untagged/Text/motd").exists());
/// assert!(backend.get(&desc)?.is_some());
/// # Ok(())
/// # }
/// ```
pub struct LocalFileBackend<C: Clock = SystemClock> {
    root: PathBuf,
    codecs: Arc<CodecRegistry>,
    clock: C,
    default_max_age: TimeDelta,
}

impl LocalFileBackend<SystemClock> {
    pub fn new(root: impl Into<PathBuf>, codecs: Arc<CodecRegistry>) -> Self {
        Self::with_clock(root, codecs, SystemClock)
    }
}

impl<C: Clock> LocalFileBackend<C> {
    pub fn with_clock(root: impl Into<PathBuf>, codecs: Arc<CodecRegistry>, clock: C) -> Self {
        Self {
            root: root.into(),
            codecs,
            clock,
            default_max_age: TimeDelta::days(DEFAULT_MAX_AGE_DAYS),
        }
    }

    /// Sets the max-age of stored copies whose descriptor does not specify one.
    pub fn with_default_max_age(mut self, max_age: TimeDelta) -> Self {
        self.default_max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_max_age(&self) -> TimeDelta {
        self.default_max_age
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn path_for(&self, desc: &Descriptor) -> PathBuf {
        self.root.join(desc.storage_path())
    }

    pub fn range_dir_for(&self, desc: &Descriptor) -> PathBuf {
        self.root.join(desc.range_dir())
    }

    pub(crate) fn write_metadata(&self, meta: &MetaData) -> DepotResult<()> {
        meta.write(&MetaData::sidecar_path(&meta.path))
    }

    /// Stores `value` and records the write in its sidecar.
    fn store(&self, desc: &Descriptor, value: &Value) -> DepotResult<PathBuf> {
        let path = self.path_for(desc);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let source_file = value
            .as_artifact()
            .and_then(downcast_ref::<FileArtifact>)
            .map(|file| file.path().to_path_buf());
        match source_file {
            Some(source) if source == path => {}
            Some(source) => {
                let mut reader = File::open(&source).with_path(&source)?;
                let mut writer = StagedFile::new(&path, &mut rand::rng()).with_path(&path)?;
                io::copy(&mut reader, &mut writer).with_path(&path)?;
                writer.close().with_path(&path)?;
            }
            None => {
                let bytes = self
                    .codecs
                    .encode(desc, value)
                    .map_err(|source| codec_error(desc, source))?;
                write_staged(&path, &bytes)?;
            }
        }
        let meta = MetaData::new(desc, &path).written_at(self.clock.now());
        self.write_metadata(&meta)?;
        trace!(%desc, path = %path.display(), "stored");
        Ok(path)
    }

    fn load(&self, desc: &Descriptor, path: &Path) -> DepotResult<Value> {
        if desc.kind() == KIND_FILE && !starts_with_link_header(path)? {
            return Ok(Value::Artifact(Arc::new(FileArtifact::new(path))));
        }
        let bytes = fs::read(path).with_path(path)?;
        self.codecs
            .decode(desc, &bytes)
            .map_err(|source| codec_error(desc, source))
    }

    /// Overlapping bucket files of a ranged descriptor, sorted by start time.
    fn buckets(
        &self,
        desc: &Descriptor,
        range: &TimeRange,
    ) -> DepotResult<Vec<(TimeRange, PathBuf)>> {
        let dir = self.range_dir_for(desc);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(IoPathError::new(err, dir).into()),
        };
        let mut buckets = Vec::new();
        for entry in entries {
            let entry = entry.with_path(&dir)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(META_SUFFIX) {
                continue;
            }
            if let Some(bucket) = TimeRange::from_bucket_name(&name) {
                if bucket.overlaps(range) {
                    buckets.push((bucket, entry.path()));
                }
            }
        }
        buckets.sort_by_key(|(bucket, _)| (bucket.start(), bucket.end()));
        Ok(buckets)
    }

    fn get_ranged(&self, desc: &Descriptor, range: &TimeRange) -> DepotResult<Option<Value>> {
        let buckets = self.buckets(desc, range)?;
        if buckets.is_empty() {
            debug!(%desc, "no bucket overlaps the requested range");
            return Ok(None);
        }
        if desc.kind() == KIND_FILE {
            let joined = self
                .range_dir_for(desc)
                .join(format!("{}.joined", range.bucket_name()));
            let mut writer = StagedFile::new(&joined, &mut rand::rng()).with_path(&joined)?;
            for (_, path) in &buckets {
                let mut reader = File::open(path).with_path(path)?;
                io::copy(&mut reader, &mut writer).with_path(&joined)?;
            }
            writer.close().with_path(&joined)?;
            return Ok(Some(Value::Artifact(Arc::new(FileArtifact::new(joined)))));
        }
        let mut parts: Vec<ArtifactRef> = Vec::with_capacity(buckets.len());
        for (_, path) in &buckets {
            match self.load(desc, path)? {
                Value::Artifact(part) => parts.push(part),
                Value::Link(_) => {
                    return Err(codec_error(
                        desc,
                        CodecError::WrongType {
                            expected: desc.kind().to_string(),
                            found: "link".to_string(),
                        },
                    ));
                }
            }
        }
        self.codecs
            .join(desc.kind(), parts, range)
            .map(|joined| Some(Value::Artifact(joined)))
            .map_err(|source| codec_error(desc, source))
    }

    fn collect_keys(
        &self,
        dir: &Path,
        partial: &Descriptor,
        keys: &mut Vec<Descriptor>,
    ) -> DepotResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(IoPathError::new(err, dir).into()),
        };
        for entry in entries {
            let entry = entry.with_path(dir)?;
            let path = entry.path();
            if entry.file_type().with_path(&path)?.is_dir() {
                self.collect_keys(&path, partial, keys)?;
            } else if path.to_str().is_some_and(|p| p.ends_with(META_SUFFIX)) {
                match MetaData::read(&path)? {
                    Some(meta) if partial.partial_match(&meta.descriptor) => {
                        keys.push(meta.descriptor)
                    }
                    Some(_) => {}
                    None => warn!(path = %path.display(), "skipping unreadable metadata"),
                }
            }
        }
        Ok(())
    }
}

impl<C: Clock> Backend for LocalFileBackend<C> {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        if let Some(range) = desc.range() {
            return self.get_ranged(desc, range);
        }
        let path = self.path_for(desc);
        if !path.is_file() {
            return Ok(None);
        }
        trace!(%desc, path = %path.display(), "loading");
        self.load(desc, &path).map(Some)
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        self.store(desc, &value).map(|_| ())
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        let path = self.path_for(desc);
        remove_if_exists(&path)?;
        remove_if_exists(&MetaData::sidecar_path(&path))
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        match desc.range() {
            Some(range) => Ok(!self.buckets(desc, range)?.is_empty()),
            None => Ok(self.path_for(desc).is_file()),
        }
    }

    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        let path = self.path_for(desc);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(IoPathError::new(err, path).into()),
        }
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        let path = self.path_for(desc);
        let meta = match MetaData::read(&MetaData::sidecar_path(&path))? {
            Some(meta) => Some(meta),
            None => match fs::metadata(&path) {
                Ok(file_meta) => {
                    let modified = file_meta.modified().with_path(&path)?;
                    Some(MetaData::new(desc, &path).written_at(DateTime::<Utc>::from(modified)))
                }
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => return Err(IoPathError::new(err, path).into()),
            },
        };
        Ok(meta.map(|mut meta| {
            if let Some(max_age) = desc.max_age() {
                meta.max_age_secs = Some(max_age.num_seconds());
            }
            meta
        }))
    }

    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        Ok(self.path_for(desc))
    }

    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        let mut dir = self.root.clone();
        if !partial.tag().is_empty() {
            if let Some(tag_dir) = partial.storage_path().iter().next() {
                dir.push(tag_dir);
            }
        }
        let mut keys = Vec::new();
        self.collect_keys(&dir, partial, &mut keys)?;
        Ok(keys)
    }

    fn init(&self) -> DepotResult<()> {
        fs::create_dir_all(&self.root).with_path(&self.root)?;
        clean_leftover_tmp_files(&self.root).with_path(&self.root)?;
        debug!(root = %self.root.display(), "local file store ready");
        Ok(())
    }
}

fn codec_error(desc: &Descriptor, source: CodecError) -> DepotError {
    match source {
        CodecError::WrongType { expected, found } => DepotError::TypeMismatch {
            desc: desc.clone(),
            expected,
            found,
        },
        source => DepotError::Codec {
            desc: desc.clone(),
            source,
        },
    }
}

fn write_staged(path: &Path, bytes: &[u8]) -> DepotResult<()> {
    let mut writer = StagedFile::new(path, &mut rand::rng()).with_path(path)?;
    writer.write_all(bytes).with_path(path)?;
    writer.close().with_path(path)?;
    Ok(())
}

fn starts_with_link_header(path: &Path) -> DepotResult<bool> {
    let mut head = Vec::with_capacity(LINK_HEADER.len());
    File::open(path)
        .and_then(|file| file.take(LINK_HEADER.len() as u64).read_to_end(&mut head))
        .with_path(path)?;
    Ok(head == LINK_HEADER)
}

fn remove_if_exists(path: &Path) -> DepotResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(IoPathError::new(err, path).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{KIND_MAP, KIND_TEXT, MapArtifact, Text};
    use crate::backend::tests::{text, text_of};
    use crate::descriptor::SerializerKind;
    use crate::test_backend;
    use std::ops::Deref;
    use tempfile::{TempDir, tempdir};

    pub(crate) struct LocalFileBackendFixture {
        backend: LocalFileBackend,
        _tempdir: TempDir,
    }

    impl LocalFileBackendFixture {
        fn new() -> Self {
            let tempdir = tempdir().unwrap();
            Self {
                backend: LocalFileBackend::new(
                    tempdir.path(),
                    Arc::new(CodecRegistry::with_defaults()),
                ),
                _tempdir: tempdir,
            }
        }
    }

    impl Deref for LocalFileBackendFixture {
        type Target = LocalFileBackend;

        fn deref(&self) -> &Self::Target {
            &self.backend
        }
    }

    test_backend!(local_file_backend_tests, LocalFileBackendFixture::new());

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_writes_artifact_and_sidecar_under_tag_and_kind() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x").with_tag("news");
        fixture.put(&desc, text("body")).unwrap();
        let path = fixture.root().join("news/Text/x");
        assert_eq!(fs::read(&path).unwrap(), b"depot-kind:Text\n\"body\"");
        assert!(MetaData::sidecar_path(&path).exists());
    }

    #[test]
    fn test_binary_gzipped_round_trip() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x")
            .with_serializer(SerializerKind::Binary)
            .gzipped();
        fixture.put(&desc, text("compressed")).unwrap();
        assert_eq!(text_of(fixture.get(&desc).unwrap()).as_deref(), Some("compressed"));
    }

    #[test]
    fn test_undecodable_file_is_a_corruption_error() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x");
        let path = fixture.path_for(&desc);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{broken").unwrap();
        assert!(fixture.get(&desc).unwrap_err().is_corruption());
        assert_eq!(fixture.get_raw(&desc).unwrap().unwrap(), b"{broken");
    }

    #[test]
    fn test_raw_files_are_copied() {
        let fixture = LocalFileBackendFixture::new();
        let source_dir = tempdir().unwrap();
        let source = source_dir.path().join("report.csv");
        fs::write(&source, b"a,b\n1,2\n").unwrap();
        let desc = Descriptor::new(KIND_FILE, "report");
        fixture
            .put(&desc, Value::Artifact(Arc::new(FileArtifact::new(&source))))
            .unwrap();
        fs::remove_file(&source).unwrap();

        let stored = fixture.get(&desc).unwrap().unwrap().into_artifact().unwrap();
        let file = downcast_ref::<FileArtifact>(&stored).unwrap();
        assert_eq!(file.path(), fixture.path_for(&desc));
        assert_eq!(fs::read(file.path()).unwrap(), b"a,b\n1,2\n");
    }

    #[test]
    fn test_links_are_stored_and_loaded() {
        let fixture = LocalFileBackendFixture::new();
        let target = Descriptor::new(KIND_FILE, "target");
        let link = Descriptor::new(KIND_FILE, "link").as_symlink();
        fixture.put(&link, Value::Link(target.clone())).unwrap();
        match fixture.get(&Descriptor::new(KIND_FILE, "link")).unwrap() {
            Some(Value::Link(loaded)) => assert_eq!(loaded, target),
            other => panic!("expected a link, got {other:?}"),
        }
    }

    #[test]
    fn test_ranged_get_joins_overlapping_buckets_in_order() {
        let fixture = LocalFileBackendFixture::new();
        let bucket = |start, end| {
            Descriptor::new(KIND_TEXT, "log").with_range(TimeRange::new(at(start), at(end)))
        };
        fixture.put(&bucket(3600, 7200), text("second;")).unwrap();
        fixture.put(&bucket(0, 3600), text("first;")).unwrap();
        fixture.put(&bucket(7200, 10800), text("third;")).unwrap();

        let query = bucket(1800, 7300);
        assert_eq!(
            text_of(fixture.get(&query).unwrap()).as_deref(),
            Some("first;second;third;")
        );
        assert_eq!(
            text_of(fixture.get(&bucket(3600, 7200)).unwrap()).as_deref(),
            Some("second;")
        );
        assert!(fixture.contains(&query).unwrap());
    }

    #[test]
    fn test_ranged_and_unranged_ids_keep_separate_slots() {
        let fixture = LocalFileBackendFixture::new();
        let ranged = Descriptor::new(KIND_TEXT, "log").with_range(TimeRange::new(at(0), at(60)));
        let unranged = Descriptor::new(KIND_TEXT, "log_");
        fixture.put(&ranged, text("bucket")).unwrap();
        fixture.put(&unranged, text("plain")).unwrap();
        assert_eq!(text_of(fixture.get(&ranged).unwrap()).as_deref(), Some("bucket"));
        assert_eq!(text_of(fixture.get(&unranged).unwrap()).as_deref(), Some("plain"));
    }

    #[test]
    fn test_stored_kind_survives_reading_through_another_kind() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x");
        let map: MapArtifact = [("k", "v")].into_iter().collect();
        fixture.put(&desc, Value::Artifact(Arc::new(map))).unwrap();
        let loaded = fixture.get(&desc).unwrap().unwrap().into_artifact().unwrap();
        assert_eq!(loaded.kind(), KIND_MAP);
    }

    #[test]
    fn test_ranged_get_without_overlap_is_a_miss() {
        let fixture = LocalFileBackendFixture::new();
        let desc = |start, end| {
            Descriptor::new(KIND_MAP, "series").with_range(TimeRange::new(at(start), at(end)))
        };
        fixture
            .put(
                &desc(0, 60),
                Value::Artifact(Arc::new(MapArtifact::from_iter([("a", "1")]))),
            )
            .unwrap();
        assert!(fixture.get(&desc(120, 180)).unwrap().is_none());
        assert!(!fixture.contains(&desc(120, 180)).unwrap());
        assert!(fixture.get(&desc(30, 90)).unwrap().is_some());
    }

    #[test]
    fn test_ranged_raw_files_are_concatenated() {
        let fixture = LocalFileBackendFixture::new();
        let source_dir = tempdir().unwrap();
        for (start, content) in [(0, "a\n"), (60, "b\n")] {
            let source = source_dir.path().join(format!("{start}"));
            fs::write(&source, content).unwrap();
            let desc = Descriptor::new(KIND_FILE, "events")
                .with_range(TimeRange::new(at(start), at(start + 60)));
            fixture
                .put(&desc, Value::Artifact(Arc::new(FileArtifact::new(&source))))
                .unwrap();
        }
        let query =
            Descriptor::new(KIND_FILE, "events").with_range(TimeRange::new(at(0), at(120)));
        let joined = fixture.get(&query).unwrap().unwrap().into_artifact().unwrap();
        let file = downcast_ref::<FileArtifact>(&joined).unwrap();
        assert_eq!(fs::read_to_string(file.path()).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_metadata_uses_descriptor_max_age() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x");
        fixture.put(&desc, text("x")).unwrap();
        let overridden = desc.clone().with_max_age(TimeDelta::minutes(5));
        let meta = fixture.get_metadata(&overridden).unwrap().unwrap();
        assert_eq!(meta.max_age_secs, Some(300));
    }

    #[test]
    fn test_metadata_without_sidecar_falls_back_to_file_time() {
        let fixture = LocalFileBackendFixture::new();
        let desc = Descriptor::new(KIND_TEXT, "x");
        fixture.put(&desc, text("x")).unwrap();
        fs::remove_file(MetaData::sidecar_path(&fixture.path_for(&desc))).unwrap();
        let meta = fixture.get_metadata(&desc).unwrap().unwrap();
        assert!(meta.write_time.is_some());
    }

    #[test]
    fn test_clock_drives_write_time() {
        let tempdir = tempdir().unwrap();
        let clock = crate::test_util::clock::ControlledClock::new(at(1000));
        let backend = LocalFileBackend::with_clock(
            tempdir.path(),
            Arc::new(CodecRegistry::with_defaults()),
            clock,
        );
        let desc = Descriptor::new(KIND_TEXT, "x");
        backend
            .put(&desc, Value::Artifact(Arc::new(Text::new("x"))))
            .unwrap();
        assert_eq!(
            backend.get_metadata(&desc).unwrap().unwrap().write_time,
            Some(at(1000))
        );
    }

    #[test]
    fn test_init_creates_root_and_cleans_staging_files() {
        let tempdir = tempdir().unwrap();
        let root = tempdir.path().join("store");
        let backend = LocalFileBackend::new(&root, Arc::new(CodecRegistry::with_defaults()));
        backend.init().unwrap();
        assert!(root.is_dir());
    }
}
