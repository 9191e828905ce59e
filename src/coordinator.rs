//! The front end: locking, identity, error policy, merging, symlinks and modules.

use crate::artifact::{
    Artifact, ArtifactRef, KIND_FILE, Text, Value, downcast, is_live, same_artifact,
};
use crate::backend::Backend;
use crate::codec::{ArtifactCodec, CodecRegistry};
use crate::config::DepotConfig;
use crate::descriptor::Descriptor;
use crate::error::{DepotError, DepotResult};
use crate::identity::IdentityCache;
use crate::locker::KeyedLocker;
use crate::merge::{Merger, MergerRegistry};
use crate::meta::MetaData;
use crate::policy::{ErrorPolicy, QuarantinePredicate, RecoveryHook, default_quarantine_predicate};
use data_encoding::BASE64;
use std::any::type_name;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Links followed by a single get before giving up.
pub const MAX_SYMLINK_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotSettings {
    pub error_policy: ErrorPolicy,
    /// Whether a failing module leaves the rest of a cascading put or remove untouched.
    pub allow_module_failures: bool,
    /// Whether replacing a live not-overwritable artifact fails instead of only being logged.
    pub strict_overwrite: bool,
}

impl Default for DepotSettings {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::default(),
            allow_module_failures: true,
            strict_overwrite: false,
        }
    }
}

/// A typed, identity-preserving cache over a chain of [Backend]s.
///
/// Every operation on a descriptor holds that descriptor's lock for its whole duration, so
/// concurrent gets of equal descriptors observe a single load and return the same `Arc`.
/// Operations on different descriptors do not block each other.
///
/// # Examples
///
/// ```rust
/// # use depot::error::DepotResult;
/// # fn main() -> DepotResult<()> {
/// use std::sync::Arc;
/// use depot::Depot;
/// use depot::artifact::{ArtifactRef, Text, same_artifact};
/// use depot::backend::local::LocalFileBackend;
/// use depot::codec::CodecRegistry;
/// use depot::descriptor::Descriptor;
///
/// let dir = tempfile::tempdir().unwrap();
/// let codecs = Arc::new(CodecRegistry::with_defaults());
/// let depot = Depot::new(LocalFileBackend::new(dir.path(), codecs.clone()), codecs);
///
/// let desc = Descriptor::new("Text", "motd");
/// let motd: ArtifactRef = Arc::new(Text::new("Hello, world!"));
/// depot.put(&desc, motd.clone())?;
/// assert!(same_artifact(&depot.get(&desc)?.unwrap(), &motd));
/// # Ok(())
/// # }
/// ```
pub struct Depot {
    backend: Arc<dyn Backend>,
    identity: IdentityCache,
    locks: KeyedLocker<Descriptor>,
    codecs: Arc<CodecRegistry>,
    mergers: Arc<MergerRegistry>,
    settings: DepotSettings,
    quarantine: QuarantinePredicate,
    recovery: Option<Arc<dyn RecoveryHook>>,
}

impl Depot {
    pub fn new(backend: impl Backend + 'static, codecs: Arc<CodecRegistry>) -> Self {
        Self::with_backend(Arc::new(backend), codecs)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            backend,
            identity: IdentityCache::new(),
            locks: KeyedLocker::new(),
            codecs,
            mergers: Arc::new(MergerRegistry::with_defaults()),
            settings: DepotSettings::default(),
            quarantine: default_quarantine_predicate(),
            recovery: None,
        }
    }

    /// Builds the configured backend chain and a depot on top of it.
    pub fn from_config(config: &DepotConfig) -> DepotResult<Self> {
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let mergers = Arc::new(MergerRegistry::with_defaults());
        let backend = config.build_backend(Arc::clone(&codecs), Arc::clone(&mergers))?;
        Ok(Self::with_backend(backend, codecs)
            .with_mergers(mergers)
            .with_settings(config.depot_settings()))
    }

    /// Shares `mergers` with the backends, so that write-behind flushes merge as well.
    pub fn with_mergers(mut self, mergers: Arc<MergerRegistry>) -> Self {
        self.mergers = mergers;
        self
    }

    pub fn with_settings(mut self, settings: DepotSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_quarantine_predicate(
        mut self,
        predicate: impl Fn(&DepotError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.quarantine = Arc::new(predicate);
        self
    }

    pub fn with_recovery_hook(mut self, hook: impl RecoveryHook + 'static) -> Self {
        self.recovery = Some(Arc::new(hook));
        self
    }

    pub fn settings(&self) -> &DepotSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn identity(&self) -> &IdentityCache {
        &self.identity
    }

    pub fn register_codec(&self, kind: impl Into<String>, codec: impl ArtifactCodec + 'static) {
        self.codecs.register(kind, codec);
    }

    pub fn register_merger(&self, kind: impl Into<String>, merger: impl Merger + 'static) {
        self.mergers.register(kind, merger);
    }

    /// The artifact stored under `desc`, following links.
    pub fn get(&self, desc: &Descriptor) -> DepotResult<Option<ArtifactRef>> {
        self.resolve(desc, 0)
    }

    /// Like [Depot::get], downcast to `T`.
    pub fn get_as<T: Artifact>(&self, desc: &Descriptor) -> DepotResult<Option<Arc<T>>> {
        let Some(artifact) = self.get(desc)? else {
            return Ok(None);
        };
        let found = artifact.kind().to_string();
        downcast::<T>(artifact)
            .map(Some)
            .ok_or_else(|| DepotError::TypeMismatch {
                desc: desc.clone(),
                expected: type_name::<T>().to_string(),
                found,
            })
    }

    fn resolve(&self, desc: &Descriptor, depth: usize) -> DepotResult<Option<ArtifactRef>> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(DepotError::SymlinkTooDeep(desc.clone(), MAX_SYMLINK_DEPTH));
        }
        let guard = self.locks.lock(desc.key());
        if let Some(bound) = self.identity.get_artifact(desc) {
            trace!(%desc, "identity cache hit");
            return Ok(Some(bound));
        }
        let value = match self.backend.get(desc) {
            Ok(value) => value,
            Err(err) => return self.on_get_error(desc, err),
        };
        match value {
            None => Ok(None),
            Some(Value::Link(target)) => {
                if target == *desc {
                    return Err(DepotError::SelfReferentialSymlink(desc.clone()));
                }
                drop(guard);
                trace!(%desc, %target, "following link");
                let artifact = self.resolve(&target, depth + 1)?;
                match artifact {
                    Some(artifact) if artifact.kind() != desc.kind() => {
                        let err = DepotError::TypeMismatch {
                            desc: desc.clone(),
                            expected: desc.kind().to_string(),
                            found: artifact.kind().to_string(),
                        };
                        self.on_get_error(desc, err)
                    }
                    artifact => Ok(artifact),
                }
            }
            Some(Value::Artifact(artifact)) => {
                if artifact.kind() != desc.kind() {
                    let err = DepotError::TypeMismatch {
                        desc: desc.clone(),
                        expected: desc.kind().to_string(),
                        found: artifact.kind().to_string(),
                    };
                    return self.on_get_error(desc, err);
                }
                if !is_live(&*artifact) {
                    debug!(%desc, "stored artifact is dead, treating it as absent");
                    return Ok(None);
                }
                artifact.init();
                self.check_own_descriptor(desc, &artifact);
                self.identity.bind(&artifact, desc)?;
                Ok(Some(artifact))
            }
        }
    }

    /// Stores `artifact` and its modules and binds it to `desc`.
    pub fn put(&self, desc: &Descriptor, artifact: ArtifactRef) -> DepotResult<()> {
        if desc.is_read_only() {
            return Err(DepotError::ReadOnly(desc.clone()));
        }
        if desc.is_symlink() {
            return Err(DepotError::NotASymlink(desc.clone()));
        }
        let _guard = self.locks.lock(desc.key());
        match self.put_locked(desc, &artifact) {
            Ok(()) => Ok(()),
            Err(err) => self.on_put_error(desc, err),
        }
    }

    fn put_locked(&self, desc: &Descriptor, artifact: &ArtifactRef) -> DepotResult<()> {
        if artifact.kind() != desc.kind() {
            return Err(DepotError::TypeMismatch {
                desc: desc.clone(),
                expected: desc.kind().to_string(),
                found: artifact.kind().to_string(),
            });
        }
        if !is_live(&**artifact) {
            return Err(DepotError::DeadArtifact(desc.clone()));
        }
        self.guard_overwrite(desc, artifact)?;
        self.check_own_descriptor(desc, artifact);
        self.backend.put(desc, Value::Artifact(Arc::clone(artifact)))?;
        self.identity.bind(artifact, desc)?;
        self.put_modules(desc, artifact)
    }

    fn guard_overwrite(&self, desc: &Descriptor, artifact: &ArtifactRef) -> DepotResult<()> {
        if !self.settings.strict_overwrite || !artifact.not_overwritable() {
            return Ok(());
        }
        match self.identity.get_artifact(desc) {
            Some(existing) if !same_artifact(&existing, artifact) => {
                error!(
                    %desc,
                    existing = ?existing,
                    replacement = ?artifact,
                    "refusing to replace a live not-overwritable artifact"
                );
                Err(DepotError::OverwriteConflict(desc.clone()))
            }
            _ => Ok(()),
        }
    }

    fn put_modules(&self, owner: &Descriptor, artifact: &ArtifactRef) -> DepotResult<()> {
        for (module_desc, module) in artifact.modules() {
            if module_desc.is_read_only() {
                trace!(%owner, module = %module_desc, "skipping read-only module");
                continue;
            }
            let result = {
                let _guard = self.locks.lock(module_desc.key());
                self.put_locked(&module_desc, &module)
            };
            if let Err(err) = result {
                self.module_failed(owner, module_desc, err)?;
            }
        }
        Ok(())
    }

    fn module_failed(
        &self,
        owner: &Descriptor,
        module: Descriptor,
        err: DepotError,
    ) -> DepotResult<()> {
        if self.settings.allow_module_failures {
            warn!(%owner, %module, error = %err, "ignoring failed module");
            Ok(())
        } else {
            Err(DepotError::Module {
                owner: owner.clone(),
                module,
                source: Box::new(err),
            })
        }
    }

    /// Returns the live value if there is one, otherwise stores `artifact` and returns `None`.
    pub fn put_if_absent(
        &self,
        desc: &Descriptor,
        artifact: ArtifactRef,
    ) -> DepotResult<Option<ArtifactRef>> {
        let _guard = self.locks.lock(desc.key());
        if let Some(existing) = self.get(desc)? {
            if let Some(bound) = self.identity.descriptor_of(&existing) {
                if bound != *desc {
                    warn!(%desc, %bound, "existing artifact is bound to another descriptor");
                }
            }
            return Ok(Some(existing));
        }
        self.put(desc, artifact)?;
        Ok(None)
    }

    /// Takes a snapshot of the current value as the base of a later [Depot::update].
    ///
    /// Returns `false` if `desc` is already marked or nothing is stored.
    pub fn mark_for_merge(&self, desc: &mut Descriptor) -> DepotResult<bool> {
        if desc.merge_snapshot().is_some() {
            return Ok(false);
        }
        let Some(current) = self.get(desc)? else {
            debug!(%desc, "nothing to snapshot");
            return Ok(false);
        };
        let snapshot = self.deep_copy(desc, &current)?;
        Ok(desc.mark_for_merge(snapshot))
    }

    /// Stores an edit made since [Depot::mark_for_merge], merged with whatever has been stored
    /// in the meantime. Returns the value that was stored.
    ///
    /// Without a merger for the artifact's kind the edit overwrites the stored value.
    pub fn update(&self, desc: &mut Descriptor, artifact: ArtifactRef) -> DepotResult<ArtifactRef> {
        if desc.is_read_only() {
            return Err(DepotError::ReadOnly(desc.clone()));
        }
        let Some(before) = desc.merge_snapshot().cloned() else {
            return Err(DepotError::MissingMergeSnapshot(desc.clone()));
        };
        let _guard = self.locks.lock(desc.key());
        let latest = self.backend.get(desc)?.and_then(Value::into_artifact);
        let merged = match latest {
            Some(latest) if !same_artifact(&latest, &artifact) => {
                match self.mergers.merge(&before, &artifact, &latest)? {
                    Some(merged) => merged,
                    None => {
                        warn!(%desc, kind = artifact.kind(), "no merger registered, overwriting");
                        Arc::clone(&artifact)
                    }
                }
            }
            _ => Arc::clone(&artifact),
        };
        self.backend.put(desc, Value::Artifact(Arc::clone(&merged)))?;
        self.identity.forget(desc);
        self.identity.bind(&merged, desc)?;
        match self.deep_copy(desc, &merged) {
            Ok(snapshot) => desc.remark_for_merge(snapshot),
            Err(err) => {
                debug!(%desc, error = %err, "cannot refresh merge snapshot");
                desc.clear_merge_snapshot();
            }
        }
        Ok(merged)
    }

    fn deep_copy(&self, desc: &Descriptor, artifact: &ArtifactRef) -> DepotResult<ArtifactRef> {
        self.codecs
            .copy(artifact)
            .map_err(|source| DepotError::Codec {
                desc: desc.clone(),
                source,
            })
    }

    /// Makes `from` a link to `to`.
    pub fn put_symlink(&self, from: &Descriptor, to: &Descriptor) -> DepotResult<()> {
        if from.is_read_only() {
            return Err(DepotError::ReadOnly(from.clone()));
        }
        if from == to {
            return Err(DepotError::SelfReferentialSymlink(from.clone()));
        }
        let _guard = self.locks.lock(from.key());
        self.backend.put(from, Value::Link(to.key()))?;
        self.identity.forget(from);
        debug!(%from, %to, "linked");
        Ok(())
    }

    pub fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        if desc.is_read_only() {
            return Err(DepotError::ReadOnly(desc.clone()));
        }
        let _guard = self.locks.lock(desc.key());
        self.identity.forget(desc);
        self.backend.remove(desc)
    }

    /// Removes `artifact` from wherever it is bound, together with its modules.
    pub fn remove_all(&self, artifact: &ArtifactRef) -> DepotResult<()> {
        let Some(desc) = self
            .identity
            .descriptor_of(artifact)
            .or_else(|| artifact.descriptor())
        else {
            debug!(artifact = ?artifact, "not bound, nothing to remove");
            return Ok(());
        };
        self.remove(&desc)?;
        for (module_desc, _) in artifact.modules() {
            if module_desc.is_read_only() {
                continue;
            }
            if let Err(err) = self.remove(&module_desc) {
                self.module_failed(&desc, module_desc, err)?;
            }
        }
        Ok(())
    }

    pub fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        let _guard = self.locks.lock(desc.key());
        if self.identity.get_artifact(desc).is_some() {
            return Ok(true);
        }
        self.backend.contains(desc)
    }

    pub fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        self.backend.get_raw(desc)
    }

    pub fn metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        self.backend.get_metadata(desc)
    }

    pub fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        self.backend.local_path(desc)
    }

    pub fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        self.backend.load_keys(partial)
    }

    /// Returns the cached value of `desc`, computing and storing it first if there is none or
    /// `force` is set.
    pub fn calc<F>(&self, desc: &Descriptor, force: bool, compute: F) -> DepotResult<ArtifactRef>
    where
        F: FnOnce() -> DepotResult<ArtifactRef>,
    {
        let _guard = self.locks.lock(desc.key());
        if !force {
            if let Some(cached) = self.get(desc)? {
                return Ok(cached);
            }
        }
        let computed = compute()?;
        self.put(desc, Arc::clone(&computed))?;
        Ok(computed)
    }

    pub fn flush(&self) -> DepotResult<()> {
        self.backend.flush()
    }

    /// Flushes pending writes. Call before the process exits.
    pub fn close(self) -> DepotResult<()> {
        self.flush()
    }

    /// Live bindings per artifact kind.
    pub fn current_usage(&self) -> BTreeMap<String, usize> {
        self.identity.live_count_by_kind()
    }

    fn check_own_descriptor(&self, desc: &Descriptor, artifact: &ArtifactRef) {
        if desc.is_symlink() {
            return;
        }
        if let Some(own) = artifact.descriptor() {
            if own != *desc {
                error!(%desc, %own, "artifact is stored under a descriptor it does not report");
            }
        }
    }

    fn on_get_error(
        &self,
        desc: &Descriptor,
        err: DepotError,
    ) -> DepotResult<Option<ArtifactRef>> {
        match self.settings.error_policy {
            ErrorPolicy::Throw => Err(err),
            ErrorPolicy::ReturnNull => {
                debug!(%desc, error = %err, "cannot get artifact");
                Ok(None)
            }
            ErrorPolicy::Ignore => {
                trace!(%desc, error = %err, "cannot get artifact");
                Ok(None)
            }
            ErrorPolicy::Report => {
                error!(%desc, error = %err, "cannot get artifact");
                Ok(None)
            }
            ErrorPolicy::Quarantine => {
                if (self.quarantine)(&err) {
                    self.quarantine_slot(desc, &err);
                } else {
                    error!(%desc, error = %err, "cannot get artifact, leaving stored data as is");
                }
                Ok(None)
            }
            ErrorPolicy::Ask => {
                warn!(%desc, error = %err, "cannot get artifact");
                Ok(self.recover(desc, &err))
            }
            ErrorPolicy::Fatal => {
                error!(%desc, error = %err, "cannot get artifact, terminating");
                std::process::exit(1)
            }
        }
    }

    fn on_put_error(&self, desc: &Descriptor, err: DepotError) -> DepotResult<()> {
        match self.settings.error_policy {
            ErrorPolicy::Throw | ErrorPolicy::Ask => Err(err),
            ErrorPolicy::ReturnNull => {
                debug!(%desc, error = %err, "cannot put artifact");
                Ok(())
            }
            ErrorPolicy::Ignore => {
                trace!(%desc, error = %err, "cannot put artifact");
                Ok(())
            }
            ErrorPolicy::Report => {
                error!(%desc, error = %err, "cannot put artifact");
                Ok(())
            }
            ErrorPolicy::Quarantine => {
                if (self.quarantine)(&err) {
                    self.identity.forget(desc);
                    if let Err(remove_err) = self.backend.remove(desc) {
                        error!(%desc, error = %remove_err, "cannot delete damaged slot");
                    }
                }
                Err(err)
            }
            ErrorPolicy::Fatal => {
                error!(%desc, error = %err, "cannot put artifact, terminating");
                std::process::exit(1)
            }
        }
    }

    /// Copies the undecodable bytes to the quarantine variant of `desc` and deletes the slot.
    fn quarantine_slot(&self, desc: &Descriptor, err: &DepotError) {
        let variant = desc.quarantine_variant();
        match self.backend.get_raw(desc) {
            Ok(Some(bytes)) => {
                let text = String::from_utf8(bytes)
                    .unwrap_or_else(|invalid| BASE64.encode(invalid.as_bytes()));
                let saved = self
                    .backend
                    .put(&variant, Value::Artifact(Arc::new(Text::new(text))));
                if let Err(save_err) = saved {
                    error!(%desc, error = %save_err, "cannot save damaged bytes, keeping the slot");
                    return;
                }
            }
            Ok(None) => {}
            Err(raw_err) => debug!(%desc, error = %raw_err, "no raw bytes to quarantine"),
        }
        self.identity.forget(desc);
        if let Err(remove_err) = self.backend.remove(desc) {
            error!(%desc, error = %remove_err, "cannot delete damaged slot");
            return;
        }
        warn!(%desc, %variant, error = %err, "moved damaged artifact to quarantine");
    }

    fn recover(&self, desc: &Descriptor, err: &DepotError) -> Option<ArtifactRef> {
        if desc.kind() != KIND_FILE {
            return None;
        }
        let recovered = self.recovery.as_ref()?.recover(desc, err)?;
        if recovered.kind() != desc.kind() {
            warn!(%desc, found = recovered.kind(), "ignoring recovered artifact of another kind");
            return None;
        }
        match self.identity.bind(&recovered, desc) {
            Ok(_) => Some(recovered),
            Err(bind_err) => {
                warn!(%desc, error = %bind_err, "cannot bind recovered artifact");
                None
            }
        }
    }
}
