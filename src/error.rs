//! Error types shared by all parts of the depot.

use crate::codec::CodecError;
use crate::config::LoadConfigError;
use crate::descriptor::Descriptor;
use crate::transfer::TransferError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type DepotResult<T> = Result<T, DepotError>;

/// Everything that can go wrong while getting or putting an artifact.
///
/// A missing artifact is not an error; operations report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum DepotError {
    #[error(transparent)]
    Io(#[from] IoPathError),
    #[error("cannot decode {desc}: {source}")]
    Codec {
        desc: Descriptor,
        #[source]
        source: CodecError,
    },
    #[error("{desc} holds a {found} but is declared as {expected}")]
    TypeMismatch {
        desc: Descriptor,
        expected: String,
        found: String,
    },
    #[error("{0} is read-only")]
    ReadOnly(Descriptor),
    #[error("{0} is a symlink to itself")]
    SelfReferentialSymlink(Descriptor),
    #[error("following symlinks from {0} took more than {1} hops")]
    SymlinkTooDeep(Descriptor, usize),
    #[error("{0} is a symlink descriptor, but the value is not a link")]
    NotASymlink(Descriptor),
    #[error("refusing to replace a live not-overwritable artifact at {0}")]
    OverwriteConflict(Descriptor),
    #[error("cannot bind a dead artifact to {0}")]
    DeadArtifact(Descriptor),
    #[error("{0} was not marked for merge")]
    MissingMergeSnapshot(Descriptor),
    #[error("cannot merge {kind} artifacts: {reason}")]
    Merge { kind: String, reason: String },
    #[error("module {module} of {owner} failed: {source}")]
    Module {
        owner: Descriptor,
        module: Descriptor,
        #[source]
        source: Box<DepotError>,
    },
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("failed to start the write-behind worker: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] LoadConfigError),
}

impl DepotError {
    /// Whether the error means that stored bytes exist but cannot be decoded.
    ///
    /// This is the default class of errors for which the quarantine policy moves the bytes
    /// aside and deletes the original slot.
    pub fn is_corruption(&self) -> bool {
        match self {
            DepotError::Codec { source, .. } => source.is_decode_failure(),
            _ => false,
        }
    }
}

pub type IoPathResult<T> = Result<T, IoPathError>;

/// An I/O error together with the path it occurred on.
#[derive(Debug, Error)]
#[error("I/O error on path {}: {source}", .path.display())]
pub struct IoPathError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl IoPathError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }

    pub fn io_error(&self) -> &io::Error {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<IoPathError> for io::Error {
    fn from(value: IoPathError) -> Self {
        value.source
    }
}

pub trait WithPath<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> IoPathResult<T>;
}

impl<T> WithPath<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> IoPathResult<T> {
        self.map_err(|e| IoPathError::new(e, path))
    }
}
