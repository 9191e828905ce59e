//! A second storage tier on another host.

use super::Backend;
use super::local::LocalFileBackend;
use crate::artifact::Value;
use crate::descriptor::{ANY_SERVER, CENTRAL_SERVER, Descriptor, LOCAL_SERVER, TimeRange};
use crate::error::{DepotResult, WithPath};
use crate::meta::{META_SUFFIX, MetaData};
use crate::transfer::{RemoteLocation, RemoteTransfer, TransferError};
use crate::util::clock::{Clock, SystemClock};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const TEMP_SUFFIX: &str = ".temp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    /// Name of the host this process runs on.
    pub host_name: String,
    /// Host used for the `central` affinity and for `any` without a hint.
    pub default_host: Option<String>,
    pub user: String,
    /// Root of the store on remote hosts.
    pub remote_dir: String,
    /// Whether a failed push fails the put. Otherwise it is only logged.
    pub strict_push: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            default_host: None,
            user: "depot".to_string(),
            remote_dir: "/var/lib/depot".to_string(),
            strict_push: false,
        }
    }
}

/// Wraps a [LocalFileBackend] and mirrors it to remote hosts.
///
/// Reads are served locally while the local sidecar says the copy is valid. Stale or missing
/// copies are pulled from the host named by the descriptor's server affinity; if that fails
/// the local copy, however old, is used. Writes always go to the local store and are pushed
/// unless the affinity resolves to this host.
///
/// Every transfer goes to a `.temp` path first and is renamed into place afterwards.
pub struct RemoteSyncBackend<T: RemoteTransfer, C: Clock = SystemClock> {
    local: LocalFileBackend<C>,
    transfer: T,
    settings: RemoteSettings,
}

impl<T: RemoteTransfer, C: Clock> RemoteSyncBackend<T, C> {
    pub fn new(local: LocalFileBackend<C>, transfer: T, settings: RemoteSettings) -> Self {
        Self {
            local,
            transfer,
            settings,
        }
    }

    pub fn local(&self) -> &LocalFileBackend<C> {
        &self.local
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Whether `server` names the host this process runs on.
    ///
    /// Host names match if they are equal. A dotless host name also matches any server name it
    /// prefixes, so host `db1` matches `db1.example.org`. A dotless server name prefixing the
    /// host name only earns a warning.
    pub fn is_this_host(&self, server: &str) -> bool {
        let this = self.settings.host_name.to_ascii_lowercase();
        let server = server.to_ascii_lowercase();
        if this.is_empty() || server.is_empty() {
            return false;
        }
        if !this.contains('.') && server.starts_with(&this) {
            return true;
        }
        if !server.contains('.') && this.starts_with(&server) && this != server {
            warn!(server, host = this, "dubious host name match, not treating it as local");
        }
        server == this
    }

    /// The remote host responsible for `desc`, or `None` if it lives on this host only.
    fn source_host(&self, desc: &Descriptor) -> Option<String> {
        let host = match desc.server() {
            None | Some(LOCAL_SERVER) => return None,
            Some(CENTRAL_SERVER) => self.settings.default_host.clone(),
            Some(ANY_SERVER) => match desc.server_hint() {
                Some(LOCAL_SERVER) => return None,
                Some(CENTRAL_SERVER) => self.settings.default_host.clone(),
                Some(hint) => Some(hint.to_string()),
                None => {
                    if self.settings.default_host.is_some() {
                        warn!(%desc, "no server hint for 'any' affinity, using the default host");
                    }
                    self.settings.default_host.clone()
                }
            },
            Some(server) => Some(server.to_string()),
        }?;
        if self.is_this_host(&host) {
            None
        } else {
            Some(host)
        }
    }

    /// The host a put of `desc` is pushed to. `any` only pushes with an explicit hint.
    fn push_host(&self, desc: &Descriptor) -> Option<String> {
        if desc.server() == Some(ANY_SERVER) && desc.server_hint().is_none() {
            debug!(%desc, "not pushing 'any' affinity without a server hint");
            return None;
        }
        self.source_host(desc)
    }

    fn remote_path(&self, relative: &Path) -> String {
        let mut path = self.settings.remote_dir.trim_end_matches('/').to_string();
        for component in relative.components() {
            path.push('/');
            path.push_str(&component.as_os_str().to_string_lossy());
        }
        path
    }

    fn location(&self, host: &str, relative: &Path) -> RemoteLocation {
        RemoteLocation::new(&self.settings.user, host, self.remote_path(relative))
    }

    fn is_fresh(&self, desc: &Descriptor) -> DepotResult<bool> {
        if !self.local.path_for(desc).is_file() {
            return Ok(false);
        }
        Ok(self
            .local
            .get_metadata(desc)?
            .is_some_and(|meta| meta.is_valid(self.local.now(), self.local.default_max_age())))
    }

    /// Makes the local copy of an unranged descriptor as fresh as the remote host allows.
    fn refresh(&self, desc: &Descriptor) -> DepotResult<()> {
        if self.is_fresh(desc)? {
            trace!(%desc, "local copy is valid");
            return Ok(());
        }
        let Some(host) = self.source_host(desc) else {
            return Ok(());
        };
        if let Err(err) = self.fetch(desc, &host) {
            if self.local.path_for(desc).is_file() {
                warn!(%desc, host, error = %err, "remote fetch failed, using the stale local copy");
            } else {
                debug!(%desc, host, error = %err, "remote fetch failed");
            }
        }
        Ok(())
    }

    /// Pulls the artifact and its sidecar and records the load time.
    fn fetch(&self, desc: &Descriptor, host: &str) -> DepotResult<()> {
        let path = self.local.path_for(desc);
        let remote = self.location(host, &desc.storage_path());
        debug!(%desc, %remote, "fetching");
        download(&self.transfer, &remote, &path)?;

        let staged_sidecar = with_suffix(&MetaData::sidecar_path(&path), TEMP_SUFFIX);
        let remote_meta = match self
            .transfer
            .pull(&remote.with_suffix(META_SUFFIX), &staged_sidecar)
        {
            Ok(()) => MetaData::read(&staged_sidecar)?,
            Err(err) => {
                debug!(%desc, error = %err, "no remote metadata");
                None
            }
        };
        discard(&staged_sidecar);
        let mut meta = remote_meta.unwrap_or_else(|| MetaData::new(desc, &path));
        meta.path = path;
        meta.load_time = Some(self.local.now());
        if let Some(max_age) = desc.max_age() {
            meta.max_age_secs = Some(max_age.num_seconds());
        }
        self.local.write_metadata(&meta)
    }

    /// Pulls the buckets overlapping `range` that are missing or stale locally.
    fn fetch_buckets(&self, desc: &Descriptor, range: &TimeRange, host: &str) -> DepotResult<()> {
        let dir = self.location(host, &desc.range_dir());
        let names = self.transfer.list(&dir)?;
        for bucket in names
            .iter()
            .filter_map(|name| TimeRange::from_bucket_name(name))
            .filter(|bucket| bucket.overlaps(range))
        {
            let bucket_desc = desc.clone().with_range(bucket);
            if !self.is_fresh(&bucket_desc)? {
                self.fetch(&bucket_desc, host)?;
            }
        }
        Ok(())
    }

    fn refresh_ranged(&self, desc: &Descriptor, range: &TimeRange) {
        let Some(host) = self.source_host(desc) else {
            return;
        };
        if let Err(err) = self.fetch_buckets(desc, range, &host) {
            warn!(%desc, host, error = %err, "cannot fetch remote buckets, using local ones");
        }
    }

    fn push(&self, desc: &Descriptor, host: &str) -> Result<(), TransferError> {
        let path = self.local.path_for(desc);
        let remote = self.location(host, &desc.storage_path());
        debug!(%desc, %remote, "pushing");
        upload(&self.transfer, &path, &remote)?;
        let sidecar = MetaData::sidecar_path(&path);
        if sidecar.is_file() {
            upload(&self.transfer, &sidecar, &remote.with_suffix(META_SUFFIX))?;
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "cannot remove temporary file");
        }
    }
}

fn upload<T: RemoteTransfer>(
    transfer: &T,
    local: &Path,
    remote: &RemoteLocation,
) -> Result<(), TransferError> {
    let staged = remote.with_suffix(TEMP_SUFFIX);
    transfer.push(local, &staged)?;
    transfer.rename(&staged, &remote.path)
}

fn download<T: RemoteTransfer>(
    transfer: &T,
    remote: &RemoteLocation,
    local: &Path,
) -> DepotResult<()> {
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    let staged = with_suffix(local, TEMP_SUFFIX);
    if let Err(err) = transfer.pull(remote, &staged) {
        discard(&staged);
        return Err(err.into());
    }
    fs::rename(&staged, local).with_path(local)?;
    Ok(())
}

impl<T: RemoteTransfer, C: Clock> Backend for RemoteSyncBackend<T, C> {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        match desc.range() {
            Some(range) => self.refresh_ranged(desc, range),
            None => self.refresh(desc)?,
        }
        self.local.get(desc)
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        self.local.put(desc, value)?;
        let Some(host) = self.push_host(desc) else {
            return Ok(());
        };
        match self.push(desc, &host) {
            Ok(()) => Ok(()),
            Err(err) if self.settings.strict_push => Err(err.into()),
            Err(err) => {
                warn!(%desc, host, error = %err, "push failed, the copy stays local");
                Ok(())
            }
        }
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        self.local.remove(desc)?;
        if let Some(host) = self.push_host(desc) {
            let remote = self.location(&host, &desc.storage_path());
            let removed = self
                .transfer
                .remove(&remote)
                .and_then(|()| self.transfer.remove(&remote.with_suffix(META_SUFFIX)));
            if let Err(err) = removed {
                warn!(%desc, %remote, error = %err, "cannot remove the remote copy");
            }
        }
        Ok(())
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        if self.local.contains(desc)? && desc.range().is_none() && self.is_fresh(desc)? {
            return Ok(true);
        }
        match desc.range() {
            Some(range) => self.refresh_ranged(desc, range),
            None => self.refresh(desc)?,
        }
        self.local.contains(desc)
    }

    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        self.refresh(desc)?;
        self.local.get_raw(desc)
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        self.refresh(desc)?;
        self.local.get_metadata(desc)
    }

    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        self.local.local_path(desc)
    }

    /// Keys of the local store only; remote hosts are not enumerated.
    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        self.local.load_keys(partial)
    }

    fn init(&self) -> DepotResult<()> {
        self.local.init()
    }
}
