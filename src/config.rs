//! Loading the depot configuration from files and the environment.

use crate::backend::Backend;
use crate::backend::dispatcher::BackendDispatcher;
use crate::backend::local::LocalFileBackend;
use crate::backend::remote::{RemoteSettings, RemoteSyncBackend};
use crate::backend::write_behind::{WriteBehindBackend, WriteBehindSettings};
use crate::codec::CodecRegistry;
use crate::coordinator::DepotSettings;
use crate::error::DepotResult;
use crate::merge::MergerRegistry;
use crate::policy::ErrorPolicy;
use crate::transfer::ScpTransfer;
use crate::util::humanbytes::{ParseSizeError, parse_size};
use crate::util::memory::ProcMeminfo;
use chrono::TimeDelta;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE_VAR: &str = "DEPOT_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "config/depot.toml";

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct DepotConfig {
    /// Root directory of the local store.
    pub dir: String,
    pub store: StoreKind,
    /// Delay of the write-behind tier, empty to write synchronously.
    pub write_behind: String,
    pub write_behind_jitter: f64,
    pub error_policy: ErrorPolicy,
    pub strict_overwrite: bool,
    pub allow_module_exceptions: bool,
    /// Default validity of stored copies.
    pub max_age: String,
    /// Name of this host, empty to use `$HOSTNAME`.
    pub host_name: String,

    pub memory: MemoryConfig,
    pub remote: RemoteConfig,
}

/// The backend at the end of the chain.
#[derive(Clone, Copy, Debug, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Local,
    Remote,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
pub struct MemoryConfig {
    pub high_threshold: String,
    pub low_threshold: String,
    pub short_delay: String,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Default remote host, empty for none.
    pub host: String,
    pub user: String,
    pub port: u16,
    pub dir: String,
    pub identity_file: String,
    pub transfer_timeout: String,
    pub command_timeout: String,
    pub strict_push: bool,
}

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid duration for {key}: {source}")]
    Duration {
        key: &'static str,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid size for {key}: {source}")]
    Size {
        key: &'static str,
        #[source]
        source: ParseSizeError,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn duration(key: &'static str, value: &str) -> Result<Duration, LoadConfigError> {
    humantime::parse_duration(value.trim())
        .map_err(|source| LoadConfigError::Duration { key, source })
}

fn size(key: &'static str, value: &str) -> Result<u64, LoadConfigError> {
    parse_size(value).map_err(|source| LoadConfigError::Size { key, source })
}

impl DepotConfig {
    /// Loads defaults, then the file named by `DEPOT_CONFIG_FILE`, then `DEPOT_*` variables.
    pub fn load() -> Result<Self, LoadConfigError> {
        ConfigLoader::new().add_default_sources().load()
    }

    pub fn write_behind_delay(&self) -> Result<Option<Duration>, LoadConfigError> {
        if self.write_behind.trim().is_empty() {
            return Ok(None);
        }
        duration("write_behind", &self.write_behind).map(Some)
    }

    pub fn max_age(&self) -> Result<TimeDelta, LoadConfigError> {
        let max_age = duration("max_age", &self.max_age)?;
        TimeDelta::from_std(max_age).map_err(|err| LoadConfigError::Invalid {
            key: "max_age",
            reason: err.to_string(),
        })
    }

    pub fn write_behind_settings(&self) -> Result<Option<WriteBehindSettings>, LoadConfigError> {
        let Some(delay) = self.write_behind_delay()? else {
            return Ok(None);
        };
        if !(0.0..=1.0).contains(&self.write_behind_jitter) {
            return Err(LoadConfigError::Invalid {
                key: "write_behind_jitter",
                reason: format!("{} is not between 0 and 1", self.write_behind_jitter),
            });
        }
        let high_memory_threshold = size("memory.high_threshold", &self.memory.high_threshold)?;
        let low_memory_threshold = size("memory.low_threshold", &self.memory.low_threshold)?;
        if low_memory_threshold > high_memory_threshold {
            return Err(LoadConfigError::Invalid {
                key: "memory.low_threshold",
                reason: "must not exceed memory.high_threshold".to_string(),
            });
        }
        Ok(Some(WriteBehindSettings {
            delay,
            jitter: self.write_behind_jitter,
            short_delay: duration("memory.short_delay", &self.memory.short_delay)?,
            high_memory_threshold,
            low_memory_threshold,
        }))
    }

    /// The configured host name, falling back to `$HOSTNAME`.
    pub fn host_name(&self) -> String {
        if self.host_name.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_default()
        } else {
            self.host_name.clone()
        }
    }

    pub fn depot_settings(&self) -> DepotSettings {
        DepotSettings {
            error_policy: self.error_policy,
            allow_module_failures: self.allow_module_exceptions,
            strict_overwrite: self.strict_overwrite,
        }
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            host_name: self.host_name(),
            default_host: Some(self.remote.host.clone()).filter(|host| !host.is_empty()),
            user: self.remote.user.clone(),
            remote_dir: self.remote.dir.clone(),
            strict_push: self.remote.strict_push,
        }
    }

    pub fn scp_transfer(&self) -> Result<ScpTransfer, LoadConfigError> {
        let mut transfer = ScpTransfer::new()
            .with_port(self.remote.port)
            .with_transfer_timeout(duration(
                "remote.transfer_timeout",
                &self.remote.transfer_timeout,
            )?)
            .with_command_timeout(duration(
                "remote.command_timeout",
                &self.remote.command_timeout,
            )?);
        if !self.remote.identity_file.is_empty() {
            transfer = transfer.with_identity_file(&self.remote.identity_file);
        }
        Ok(transfer)
    }

    /// Builds and initializes the configured backend chain.
    pub fn build_backend(
        &self,
        codecs: Arc<CodecRegistry>,
        mergers: Arc<MergerRegistry>,
    ) -> DepotResult<Arc<dyn Backend>> {
        let local = LocalFileBackend::new(&self.dir, codecs).with_default_max_age(self.max_age()?);
        let tail = match self.store {
            StoreKind::Local => BackendDispatcher::from(local),
            StoreKind::Remote => BackendDispatcher::from(RemoteSyncBackend::new(
                local,
                self.scp_transfer()?,
                self.remote_settings(),
            )),
        };
        tail.init()?;
        info!(store = tail.name(), dir = %self.dir, "depot store ready");
        Ok(match self.write_behind_settings()? {
            Some(settings) => Arc::new(WriteBehindBackend::with_parts(
                tail,
                settings,
                Box::new(ProcMeminfo),
                mergers,
            )?),
            None => Arc::new(tail),
        })
    }
}

struct ConfigLoader(ConfigBuilder<DefaultState>);

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader(Config::builder())
    }

    pub fn add_default_sources(self) -> Self {
        self.add_file_source(
            File::with_name(
                &std::env::var(CONFIG_FILE_VAR)
                    .map(Cow::Owned)
                    .unwrap_or(Cow::Borrowed(DEFAULT_CONFIG_FILE)),
            )
            .required(false),
        )
        .add_environment_source(None)
    }

    pub fn add_file_source<T, F>(mut self, file: File<T, F>) -> Self
    where
        File<T, F>: Source + Send + Sync + 'static,
    {
        self.0 = self.0.add_source(file);
        self
    }

    pub fn add_environment_source(mut self, source: Option<Map<String, String>>) -> Self {
        self.0 = self.0.add_source(
            Environment::with_prefix("DEPOT")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true)
                .source(source),
        );
        self
    }

    pub fn load(self) -> Result<DepotConfig, LoadConfigError> {
        self.0
            .set_default("dir", "depot")?
            .set_default("store", "local")?
            .set_default("write_behind", "60s")?
            .set_default("write_behind_jitter", 0.1)?
            .set_default("error_policy", "quarantine")?
            .set_default("strict_overwrite", false)?
            .set_default("allow_module_exceptions", true)?
            .set_default("max_age", "30days")?
            .set_default("host_name", "")?
            .set_default("memory.high_threshold", "100MiB")?
            .set_default("memory.low_threshold", "20MiB")?
            .set_default("memory.short_delay", "1s")?
            .set_default("remote.host", "")?
            .set_default("remote.user", "depot")?
            .set_default("remote.port", 22_i64)?
            .set_default("remote.dir", "/var/lib/depot")?
            .set_default("remote.identity_file", "")?
            .set_default("remote.transfer_timeout", "45min")?
            .set_default("remote.command_timeout", "60s")?
            .set_default("remote.strict_push", false)?
            .build()?
            .try_deserialize()
            .map_err(LoadConfigError::from)
    }
}
