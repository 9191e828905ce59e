//! A "remote host" that is just another local directory.

use crate::transfer::{RemoteLocation, RemoteTransfer, TransferError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCall {
    Push(String),
    Pull(String),
    List(String),
    Rename(String, String),
    Remove(String),
}

/// Serves every host from `root`, mapping a remote path `/a/b` to `{root}/a/b`.
#[derive(Debug)]
pub struct DirTransfer {
    root: PathBuf,
    calls: Mutex<Vec<TransferCall>>,
    failing: AtomicBool,
}

impl DirTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of a remote file.
    pub fn resolve(&self, remote_path: &str) -> PathBuf {
        self.root.join(remote_path.trim_start_matches('/'))
    }

    /// Makes every call fail as if the host were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.log().clone()
    }

    pub fn clear_calls(&self) {
        self.log().clear();
    }

    /// Number of pulls, not counting metadata sidecars.
    pub fn data_pulls(&self) -> usize {
        self.log()
            .iter()
            .filter(|call| matches!(call, TransferCall::Pull(path) if !path.ends_with(".meta")))
            .count()
    }

    pub fn pushes(&self) -> usize {
        self.log()
            .iter()
            .filter(|call| matches!(call, TransferCall::Push(_)))
            .count()
    }

    fn log(&self) -> MutexGuard<'_, Vec<TransferCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: TransferCall) -> Result<(), TransferError> {
        let command = format!("{call:?}");
        self.log().push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::Failed {
                command,
                status: Some(255),
                stderr: "ssh: connect to host: Connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn io_failure(command: &str, err: std::io::Error) -> TransferError {
    let status = if err.kind() == ErrorKind::NotFound {
        Some(1)
    } else {
        Some(2)
    };
    TransferError::Failed {
        command: command.to_string(),
        status,
        stderr: err.to_string(),
    }
}

impl RemoteTransfer for DirTransfer {
    fn push(&self, local: &Path, remote: &RemoteLocation) -> Result<(), TransferError> {
        self.record(TransferCall::Push(remote.path.clone()))?;
        let target = self.resolve(&remote.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| io_failure("mkdir", err))?;
        }
        fs::copy(local, &target)
            .map(|_| ())
            .map_err(|err| io_failure("push", err))
    }

    fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<(), TransferError> {
        self.record(TransferCall::Pull(remote.path.clone()))?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| io_failure("mkdir", err))?;
        }
        fs::copy(self.resolve(&remote.path), local)
            .map(|_| ())
            .map_err(|err| io_failure("pull", err))
    }

    fn list(&self, remote: &RemoteLocation) -> Result<Vec<String>, TransferError> {
        self.record(TransferCall::List(remote.path.clone()))?;
        let entries =
            fs::read_dir(self.resolve(&remote.path)).map_err(|err| io_failure("list", err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_failure("list", err))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &RemoteLocation, to_path: &str) -> Result<(), TransferError> {
        self.record(TransferCall::Rename(from.path.clone(), to_path.to_string()))?;
        fs::rename(self.resolve(&from.path), self.resolve(to_path))
            .map_err(|err| io_failure("rename", err))
    }

    fn remove(&self, remote: &RemoteLocation) -> Result<(), TransferError> {
        self.record(TransferCall::Remove(remote.path.clone()))?;
        match fs::remove_file(self.resolve(&remote.path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_failure("remove", err)),
        }
    }
}
