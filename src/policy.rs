//! How the depot reacts when an artifact cannot be read or written.

use crate::artifact::ArtifactRef;
use crate::descriptor::Descriptor;
use crate::error::DepotError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The single place that decides between propagating, swallowing, quarantining and dying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Return the error to the caller.
    Throw,
    /// Log at debug level and report the artifact as absent.
    ReturnNull,
    /// Like [ErrorPolicy::ReturnNull], logged at trace level.
    Ignore,
    /// Log at error level and report the artifact as absent.
    Report,
    /// Move undecodable bytes aside, delete the original slot and report the artifact as
    /// absent. Errors not matched by the [QuarantinePredicate] are only logged.
    #[default]
    Quarantine,
    /// Ask the [RecoveryHook] for a replacement of a `File` artifact, otherwise like
    /// [ErrorPolicy::ReturnNull].
    Ask,
    /// Terminate the process.
    Fatal,
}

/// Decides which errors mean "the stored bytes are damaged".
pub type QuarantinePredicate = Arc<dyn Fn(&DepotError) -> bool + Send + Sync>;

pub fn default_quarantine_predicate() -> QuarantinePredicate {
    Arc::new(DepotError::is_corruption)
}

/// Offers a replacement for an artifact that could not be loaded.
pub trait RecoveryHook: Send + Sync {
    fn recover(&self, desc: &Descriptor, error: &DepotError) -> Option<ArtifactRef>;
}

impl<F> RecoveryHook for F
where
    F: Fn(&Descriptor, &DepotError) -> Option<ArtifactRef> + Send + Sync,
{
    fn recover(&self, desc: &Descriptor, error: &DepotError) -> Option<ArtifactRef> {
        self(desc, error)
    }
}
