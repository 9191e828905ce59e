//! Byte encodings of artifacts.
//!
//! A [CodecRegistry] maps artifact kinds to [ArtifactCodec]s. Each codec writes either JSON or
//! bincode, chosen per descriptor, and the registry optionally gzips the result. Every stored
//! artifact starts with a header line naming its kind and encoding, and links to other
//! descriptors start with a fixed link header, so both are read back correctly regardless of the
//! descriptor they are read through.

use crate::artifact::{Artifact, ArtifactRef, AsAny, KIND_MAP, KIND_TEXT, MapArtifact, Text, Value};
use crate::descriptor::{Descriptor, SerializerKind, TimeRange};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::type_name;
use std::collections::HashMap;
use std::io;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Header of a stored link.
pub const LINK_HEADER: &[u8] = b"depot-link\n";

/// Start of the header line naming the kind of a stored artifact, followed by `;binary` and
/// `;gzip` flags as they apply.
pub const KIND_HEADER: &[u8] = b"depot-kind:";

/// Kind and encoding recorded in front of a stored artifact.
struct Header<'a> {
    kind: &'a str,
    serializer: SerializerKind,
    gzip: bool,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed binary encoding: {0}")]
    Binary(#[from] bincode::Error),
    #[error("broken gzip stream: {0}")]
    Gzip(#[source] io::Error),
    #[error("unterminated kind header")]
    MalformedHeader,
    #[error("expected a {expected}, got a {found}")]
    WrongType { expected: String, found: String },
    #[error("{0} artifacts cannot be joined")]
    JoinUnsupported(String),
    #[error("no codec registered for kind {0:?}")]
    UnknownKind(String),
}

impl CodecError {
    /// Whether the error was raised by bytes that could not be decoded.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            CodecError::Json(_)
                | CodecError::Binary(_)
                | CodecError::Gzip(_)
                | CodecError::MalformedHeader
        )
    }
}

/// Encodes and decodes artifacts of one kind.
pub trait ArtifactCodec: Send + Sync {
    fn encode(&self, artifact: &dyn Artifact, format: SerializerKind)
    -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8], format: SerializerKind) -> Result<ArtifactRef, CodecError>;

    /// Combines the time buckets of a ranged artifact, ordered by start time, into one artifact
    /// covering `range`.
    fn join(
        &self,
        parts: Vec<ArtifactRef>,
        _range: &TimeRange,
    ) -> Result<ArtifactRef, CodecError> {
        let kind = parts
            .first()
            .map(|part| part.kind().to_string())
            .unwrap_or_default();
        Err(CodecError::JoinUnsupported(kind))
    }
}

type JoinFn<T> = fn(Vec<Arc<T>>, &TimeRange) -> T;

/// Codec for any artifact type that implements serde's traits.
pub struct SerdeCodec<T> {
    join: Option<JoinFn<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T>
where
    T: Artifact + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            join: None,
            _marker: PhantomData,
        }
    }

    pub fn with_join(join: JoinFn<T>) -> Self {
        Self {
            join: Some(join),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeCodec<T>
where
    T: Artifact + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ArtifactCodec for SerdeCodec<T>
where
    T: Artifact + Serialize + DeserializeOwned,
{
    fn encode(
        &self,
        artifact: &dyn Artifact,
        format: SerializerKind,
    ) -> Result<Vec<u8>, CodecError> {
        let value = artifact
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| CodecError::WrongType {
                expected: type_name::<T>().to_string(),
                found: artifact.kind().to_string(),
            })?;
        Ok(match format {
            SerializerKind::Json => serde_json::to_vec(value)?,
            SerializerKind::Binary => bincode::serialize(value)?,
        })
    }

    fn decode(&self, bytes: &[u8], format: SerializerKind) -> Result<ArtifactRef, CodecError> {
        let value: T = match format {
            SerializerKind::Json => serde_json::from_slice(bytes)?,
            SerializerKind::Binary => bincode::deserialize(bytes)?,
        };
        Ok(Arc::new(value))
    }

    fn join(&self, parts: Vec<ArtifactRef>, range: &TimeRange) -> Result<ArtifactRef, CodecError> {
        let Some(join) = self.join else {
            return Err(CodecError::JoinUnsupported(type_name::<T>().to_string()));
        };
        let parts = parts
            .into_iter()
            .map(|part| {
                let found = part.kind().to_string();
                AsAny::into_any_arc(part)
                    .downcast::<T>()
                    .map_err(|_| CodecError::WrongType {
                        expected: type_name::<T>().to_string(),
                        found,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(join(parts, range)))
    }
}

fn join_text(parts: Vec<Arc<Text>>, _range: &TimeRange) -> Text {
    Text::new(parts.iter().map(|part| part.as_str()).collect::<String>())
}

fn join_maps(parts: Vec<Arc<MapArtifact>>, _range: &TimeRange) -> MapArtifact {
    parts
        .iter()
        .flat_map(|part| part.entries().clone())
        .collect()
}

/// Codecs by artifact kind.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn ArtifactCodec>>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// A registry that knows the built-in [Text] and [MapArtifact] kinds.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(KIND_TEXT, SerdeCodec::<Text>::with_join(join_text));
        registry.register(KIND_MAP, SerdeCodec::<MapArtifact>::with_join(join_maps));
        registry
    }

    pub fn register(&self, kind: impl Into<String>, codec: impl ArtifactCodec + 'static) {
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), Arc::new(codec));
    }

    fn codec(&self, kind: &str) -> Result<Arc<dyn ArtifactCodec>, CodecError> {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
            .ok_or_else(|| CodecError::UnknownKind(kind.to_string()))
    }

    pub fn encode(&self, desc: &Descriptor, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::Link(target) => {
                let mut bytes = LINK_HEADER.to_vec();
                serde_json::to_writer(&mut bytes, target)?;
                Ok(bytes)
            }
            Value::Artifact(artifact) => {
                let payload = self
                    .codec(artifact.kind())?
                    .encode(&**artifact, desc.serializer())?;
                let payload = if desc.is_gzip() { gzip(&payload)? } else { payload };
                let mut bytes = KIND_HEADER.to_vec();
                bytes.extend_from_slice(artifact.kind().as_bytes());
                if desc.serializer() == SerializerKind::Binary {
                    bytes.extend_from_slice(b";binary");
                }
                if desc.is_gzip() {
                    bytes.extend_from_slice(b";gzip");
                }
                bytes.push(b'\n');
                bytes.extend_from_slice(&payload);
                Ok(bytes)
            }
        }
    }

    /// Decodes bytes written by [CodecRegistry::encode].
    ///
    /// The stored header picks the codec and encoding, so data of another kind decodes to an
    /// artifact of that kind. If no codec is registered for the stored kind, this fails with
    /// [CodecError::WrongType]. Bytes without a header are decoded as the descriptor says.
    pub fn decode(&self, desc: &Descriptor, bytes: &[u8]) -> Result<Value, CodecError> {
        if let Some(link) = bytes.strip_prefix(LINK_HEADER) {
            return Ok(Value::Link(serde_json::from_slice(link)?));
        }
        let (header, payload) = match split_header(bytes)? {
            Some(split) => split,
            None => {
                let header = Header {
                    kind: desc.kind(),
                    serializer: desc.serializer(),
                    gzip: desc.is_gzip(),
                };
                (header, bytes)
            }
        };
        let codec = self.codec(header.kind).map_err(|err| {
            if header.kind == desc.kind() {
                err
            } else {
                CodecError::WrongType {
                    expected: desc.kind().to_string(),
                    found: header.kind.to_string(),
                }
            }
        })?;
        let artifact = if header.gzip {
            codec.decode(&gunzip(payload)?, header.serializer)?
        } else {
            codec.decode(payload, header.serializer)?
        };
        Ok(Value::Artifact(artifact))
    }

    pub fn join(
        &self,
        kind: &str,
        parts: Vec<ArtifactRef>,
        range: &TimeRange,
    ) -> Result<ArtifactRef, CodecError> {
        self.codec(kind)?.join(parts, range)
    }

    /// A deep copy of `artifact`, made by encoding and decoding it.
    pub fn copy(&self, artifact: &ArtifactRef) -> Result<ArtifactRef, CodecError> {
        let codec = self.codec(artifact.kind())?;
        let bytes = codec.encode(&**artifact, SerializerKind::Json)?;
        codec.decode(&bytes, SerializerKind::Json)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Splits a leading kind header off `bytes`.
fn split_header(bytes: &[u8]) -> Result<Option<(Header<'_>, &[u8])>, CodecError> {
    let Some(rest) = bytes.strip_prefix(KIND_HEADER) else {
        return Ok(None);
    };
    let end = rest
        .iter()
        .position(|&byte| byte == b'\n')
        .ok_or(CodecError::MalformedHeader)?;
    let line = std::str::from_utf8(&rest[..end]).map_err(|_| CodecError::MalformedHeader)?;
    let mut fields = line.split(';');
    let kind = fields.next().unwrap_or_default();
    let mut header = Header {
        kind,
        serializer: SerializerKind::Json,
        gzip: false,
    };
    for flag in fields {
        match flag {
            "binary" => header.serializer = SerializerKind::Binary,
            "gzip" => header.gzip = true,
            _ => return Err(CodecError::MalformedHeader),
        }
    }
    Ok(Some((header, &rest[end + 1..])))
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(CodecError::Gzip)?;
    encoder.finish().map_err(CodecError::Gzip)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(CodecError::Gzip)?;
    Ok(decoded)
}
