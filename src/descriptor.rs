//! Descriptors identify an artifact and the place where it is stored.

use crate::artifact::ArtifactRef;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Server affinity meaning "never leave this host".
pub const LOCAL_SERVER: &str = "local";
/// Server affinity meaning "whichever remote host the hint or the configuration names".
pub const ANY_SERVER: &str = "any";
/// Server affinity resolving to the configured default remote host.
pub const CENTRAL_SERVER: &str = "central";
pub const DEFAULT_TAG: &str = "untagged";

const MAX_SEGMENT_LEN: usize = 140;
const SHORTENED_PREFIX_LEN: usize = 100;
/// Escaped segments only carry `%` before two hex digits or at their start, so no escaped id
/// ends with this.
const RANGE_DIR_SUFFIX: &str = "%r";

/// Byte format used to store an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// Human-readable JSON.
    #[default]
    Json,
    /// Compact bincode.
    Binary,
}

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// File name of the bucket holding this range, `{start}__{end}` in Unix seconds.
    pub fn bucket_name(&self) -> String {
        format!("{}__{}", self.start.timestamp(), self.end.timestamp())
    }

    /// Parses a file name produced by [TimeRange::bucket_name].
    pub fn from_bucket_name(name: &str) -> Option<TimeRange> {
        let (start, end) = name.split_once("__")?;
        let is_timestamp = |s: &str| {
            let digits = s.strip_prefix('-').unwrap_or(s);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        };
        if !is_timestamp(start) || !is_timestamp(end) {
            return None;
        }
        let start = DateTime::from_timestamp(start.parse().ok()?, 0)?;
        let end = DateTime::from_timestamp(end.parse().ok()?, 0)?;
        Some(TimeRange::new(start, end))
    }
}

/// Key of an artifact.
///
/// Two descriptors are equal, hash alike and map to the same storage path if and only if their
/// kind, tag, id and range are equal. All other attributes are hints about how to store or
/// locate the artifact.
///
/// # Examples
///
/// ```rust
/// use depot::descriptor::Descriptor;
///
/// let desc = Descriptor::new("Text", "greeting").with_tag("demo");
/// assert_eq!(desc.storage_path().to_str(), Some("demo/Text/greeting"));
/// assert_eq!(desc, Descriptor::new("Text", "greeting").with_tag("demo").gzipped());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Descriptor {
    kind: String,
    id: String,
    #[serde(default = "default_tag")]
    tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(skip)]
    server_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<TimeRange>,
    #[serde(default)]
    symlink: bool,
    #[serde(skip)]
    read_only: bool,
    #[serde(default)]
    gzip: bool,
    #[serde(default)]
    serializer: SerializerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_age_secs: Option<i64>,
    #[serde(skip)]
    before: Option<ArtifactRef>,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

impl Descriptor {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            tag: default_tag(),
            server: None,
            server_hint: None,
            range: None,
            symlink: false,
            read_only: false,
            gzip: false,
            serializer: SerializerKind::default(),
            max_age_secs: None,
            before: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Sets the host used for [ANY_SERVER] affinity. A hint of [LOCAL_SERVER] keeps writes local.
    pub fn with_server_hint(mut self, hint: impl Into<String>) -> Self {
        self.server_hint = Some(hint.into());
        self
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn as_symlink(mut self) -> Self {
        self.symlink = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn gzipped(mut self) -> Self {
        self.gzip = true;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_max_age(mut self, max_age: TimeDelta) -> Self {
        self.max_age_secs = Some(max_age.num_seconds());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn server_hint(&self) -> Option<&str> {
        self.server_hint.as_deref()
    }

    pub fn range(&self) -> Option<&TimeRange> {
        self.range.as_ref()
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip
    }

    pub fn serializer(&self) -> SerializerKind {
        self.serializer
    }

    pub fn max_age(&self) -> Option<TimeDelta> {
        self.max_age_secs.map(TimeDelta::seconds)
    }

    /// The snapshot taken by [Descriptor::mark_for_merge], if any.
    pub fn merge_snapshot(&self) -> Option<&ArtifactRef> {
        self.before.as_ref()
    }

    /// Attaches `snapshot` as the "before" state of an edit. Returns `false` and keeps the
    /// existing snapshot if the descriptor is already marked.
    pub fn mark_for_merge(&mut self, snapshot: ArtifactRef) -> bool {
        if self.before.is_some() {
            return false;
        }
        self.before = Some(snapshot);
        true
    }

    /// Replaces the snapshot, typically with the value that was just persisted.
    pub fn remark_for_merge(&mut self, snapshot: ArtifactRef) {
        self.before = Some(snapshot);
    }

    pub fn clear_merge_snapshot(&mut self) {
        self.before = None;
    }

    /// A copy without transient state, suitable as long-lived map key.
    pub fn key(&self) -> Descriptor {
        let mut key = self.clone();
        key.before = None;
        key.server_hint = None;
        key
    }

    /// Path relative to a store root: `{tag}/{kind}/{id}`, with a ranged descriptor placing its
    /// bucket file inside [Descriptor::range_dir].
    pub fn storage_path(&self) -> PathBuf {
        match &self.range {
            Some(range) => self.range_dir().join(range.bucket_name()),
            None => self.base_path(&escape_segment(&self.id)),
        }
    }

    /// Directory holding the time-bucketed files of a ranged descriptor.
    pub fn range_dir(&self) -> PathBuf {
        self.base_path(&format!("{}{RANGE_DIR_SUFFIX}", escape_segment(&self.id)))
    }

    fn base_path(&self, file_name: &str) -> PathBuf {
        let mut path = PathBuf::from(escape_segment(&self.tag));
        path.push(escape_segment(&self.kind));
        path.push(file_name);
        path
    }

    /// Whether `full` is matched by this partially filled descriptor.
    ///
    /// Empty kind, tag and id as well as unset server and range act as wildcards.
    pub fn partial_match(&self, full: &Descriptor) -> bool {
        let matches = |pattern: &str, value: &str| pattern.is_empty() || pattern == value;
        matches(&self.kind, &full.kind)
            && matches(&self.tag, &full.tag)
            && matches(&self.id, &full.id)
            && self
                .server
                .as_ref()
                .is_none_or(|server| full.server.as_ref() == Some(server))
            && self.range.as_ref().is_none_or(|range| {
                full.range
                    .as_ref()
                    .is_some_and(|full_range| range.overlaps(full_range))
            })
    }

    /// Where undecodable bytes of this descriptor are moved to: a text artifact under the
    /// `error` tag whose id records the original location.
    pub fn quarantine_variant(&self) -> Descriptor {
        let mut id = format!("{}/{}/{}", self.tag, self.kind, self.id);
        if let Some(range) = &self.range {
            id.push('/');
            id.push_str(&range.bucket_name());
        }
        Descriptor::new(crate::artifact::KIND_TEXT, id).with_tag("error")
    }
}

/// Percent-encodes everything but ASCII alphanumerics and `-_.`, and shortens over-long results
/// with a digest so that every segment is a valid file name.
fn escape_segment(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            escaped.push(c);
        } else {
            let mut buf = [0; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(escaped, "%{byte:02X}");
            }
        }
    }
    if escaped.is_empty() || escaped == "." || escaped == ".." || escaped.ends_with(".meta") {
        // Keep clear of special directory entries and metadata sidecars.
        escaped = format!("%{escaped}");
    }
    if escaped.len() > MAX_SEGMENT_LEN {
        let digest = blake3::hash(escaped.as_bytes()).to_hex();
        escaped = format!("{}_{}", &escaped[..SHORTENED_PREFIX_LEN], &digest[..32]);
    }
    escaped
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.tag == other.tag
            && self.id == other.id
            && self.range == other.range
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.tag.hash(state);
        self.id.hash(state);
        self.range.hash(state);
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Desc[{}/{}/{}", self.tag, self.kind, self.id)?;
        if let Some(range) = &self.range {
            write!(f, " {}..{}", range.start.to_rfc3339(), range.end.to_rfc3339())?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("server", &self.server)
            .field("range", &self.range)
            .field("symlink", &self.symlink)
            .field("read_only", &self.read_only)
            .field("marked_for_merge", &self.before.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Text;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_equality_ignores_storage_hints() {
        let a = Descriptor::new("Text", "x").with_tag("t");
        let b = Descriptor::new("Text", "x")
            .with_tag("t")
            .with_server("db1")
            .gzipped()
            .with_serializer(SerializerKind::Binary)
            .with_max_age(TimeDelta::hours(1));
        assert_eq!(a, b);
        assert_eq!(HashSet::from([a.clone()]).get(&b), Some(&a));
        assert_eq!(a.storage_path(), b.storage_path());
    }

    #[test]
    fn test_equality_covers_kind_tag_id_and_range() {
        let base = Descriptor::new("Text", "x");
        assert_ne!(base, Descriptor::new("Map", "x"));
        assert_ne!(base, Descriptor::new("Text", "y"));
        assert_ne!(base, Descriptor::new("Text", "x").with_tag("other"));
        assert_ne!(
            base,
            Descriptor::new("Text", "x").with_range(TimeRange::new(at(0), at(60)))
        );
    }

    #[test]
    fn test_storage_path_escapes_id() {
        let desc = Descriptor::new("Text", "a/../b c").with_tag("news");
        assert_eq!(
            desc.storage_path(),
            PathBuf::from("news/Text/a%2F..%2Fb%20c")
        );
        assert_eq!(
            Descriptor::new("Text", "..").storage_path(),
            PathBuf::from("untagged/Text/%..")
        );
        assert_eq!(
            Descriptor::new("Text", "x.meta").storage_path(),
            PathBuf::from("untagged/Text/%x.meta")
        );
    }

    #[test]
    fn test_storage_path_shortens_long_ids() {
        let long = "z".repeat(500);
        let path = Descriptor::new("Text", long.clone()).storage_path();
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.len() <= MAX_SEGMENT_LEN);
        assert_ne!(
            path,
            Descriptor::new("Text", format!("{long}y")).storage_path()
        );
    }

    #[test]
    fn test_ranged_storage_path_uses_bucket() {
        let desc = Descriptor::new("Text", "log").with_range(TimeRange::new(at(3600), at(7200)));
        assert_eq!(
            desc.storage_path(),
            PathBuf::from("untagged/Text/log%r/3600__7200")
        );
        assert_eq!(desc.range_dir(), PathBuf::from("untagged/Text/log%r"));
    }

    #[test]
    fn test_range_dir_never_collides_with_an_unranged_id() {
        let ranged = Descriptor::new("Text", "log").with_range(TimeRange::new(at(0), at(60)));
        for id in ["log_", "log%r", "log%", "log%25r"] {
            assert_ne!(Descriptor::new("Text", id).storage_path(), ranged.range_dir());
        }
    }

    #[test]
    fn test_bucket_name_round_trip_and_rejects_other_names() {
        let range = TimeRange::new(at(10), at(20));
        assert_eq!(TimeRange::from_bucket_name(&range.bucket_name()), Some(range));
        assert_eq!(TimeRange::from_bucket_name("10__20.meta"), None);
        assert_eq!(TimeRange::from_bucket_name("10__"), None);
        assert_eq!(TimeRange::from_bucket_name("readme"), None);
        assert_eq!(TimeRange::from_bucket_name("-__10"), None);
    }

    #[test]
    fn test_buckets_before_1970_round_trip() {
        let range = TimeRange::new(at(-86_400), at(-3600));
        assert_eq!(range.bucket_name(), "-86400__-3600");
        assert_eq!(TimeRange::from_bucket_name(&range.bucket_name()), Some(range));
        let straddling = TimeRange::new(at(-60), at(60));
        assert_eq!(
            TimeRange::from_bucket_name(&straddling.bucket_name()),
            Some(straddling)
        );
    }

    #[test]
    fn test_ranges_are_half_open() {
        let first = TimeRange::new(at(0), at(10));
        assert!(first.overlaps(&TimeRange::new(at(5), at(15))));
        assert!(!first.overlaps(&TimeRange::new(at(10), at(20))));
        assert_eq!(TimeRange::new(at(10), at(0)), first);
    }

    #[test]
    fn test_partial_match() {
        let full = Descriptor::new("Text", "x").with_tag("t").with_server("db1");
        assert!(Descriptor::new("Text", "").with_tag("t").partial_match(&full));
        assert!(Descriptor::new("", "").with_tag("").partial_match(&full));
        assert!(Descriptor::new("Text", "x").with_tag("t").with_server("db1").partial_match(&full));
        assert!(!Descriptor::new("Text", "x").with_tag("t").with_server("db2").partial_match(&full));
        assert!(!Descriptor::new("Map", "").with_tag("t").partial_match(&full));
        assert!(
            !Descriptor::new("Text", "")
                .with_tag("t")
                .with_range(TimeRange::new(at(0), at(1)))
                .partial_match(&full)
        );
    }

    #[test]
    fn test_mark_for_merge_keeps_first_snapshot() {
        let mut desc = Descriptor::new("Text", "x");
        let first: ArtifactRef = Arc::new(Text::new("first"));
        let second: ArtifactRef = Arc::new(Text::new("second"));
        assert!(desc.mark_for_merge(first.clone()));
        assert!(!desc.mark_for_merge(second.clone()));
        assert!(Arc::ptr_eq(desc.merge_snapshot().unwrap(), &first));
        desc.remark_for_merge(second.clone());
        assert!(Arc::ptr_eq(desc.merge_snapshot().unwrap(), &second));
        assert!(desc.key().merge_snapshot().is_none());
    }

    #[test]
    fn test_quarantine_variant_records_origin() {
        let desc = Descriptor::new("Map", "x").with_tag("t");
        let variant = desc.quarantine_variant();
        assert_eq!(variant.tag(), "error");
        assert_eq!(variant.kind(), "Text");
        assert_eq!(variant.id(), "t/Map/x");
    }

    #[test]
    fn test_serialized_form_omits_transient_state() {
        let desc = Descriptor::new("Text", "x")
            .with_server_hint("db7")
            .read_only()
            .as_symlink();
        let json = serde_json::to_string(&desc).unwrap();
        let parsed: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, desc);
        assert!(parsed.is_symlink());
        assert!(!parsed.is_read_only());
        assert_eq!(parsed.server_hint(), None);
    }
}
