//! Copying files to and from remote hosts.

use std::fmt;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(45 * 60);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A file on a remote host, `user@host:path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteLocation {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl RemoteLocation {
    pub fn new(user: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// The same host with another path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// The same location with `suffix` appended to the path.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        self.with_path(format!("{}{suffix}", self.path))
    }

    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.path)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{command} failed with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("cannot run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// The remote operations the remote-sync backend relies on. All calls block until done or timed
/// out.
pub trait RemoteTransfer: Send + Sync {
    /// Copies a local file to `remote`, creating missing remote directories.
    fn push(&self, local: &Path, remote: &RemoteLocation) -> Result<(), TransferError>;

    fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<(), TransferError>;

    /// Names of the entries of the remote directory `remote`.
    fn list(&self, remote: &RemoteLocation) -> Result<Vec<String>, TransferError>;

    fn rename(&self, from: &RemoteLocation, to_path: &str) -> Result<(), TransferError>;

    fn remove(&self, remote: &RemoteLocation) -> Result<(), TransferError>;
}

impl<T: RemoteTransfer + ?Sized> RemoteTransfer for Arc<T> {
    fn push(&self, local: &Path, remote: &RemoteLocation) -> Result<(), TransferError> {
        (**self).push(local, remote)
    }

    fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<(), TransferError> {
        (**self).pull(remote, local)
    }

    fn list(&self, remote: &RemoteLocation) -> Result<Vec<String>, TransferError> {
        (**self).list(remote)
    }

    fn rename(&self, from: &RemoteLocation, to_path: &str) -> Result<(), TransferError> {
        (**self).rename(from, to_path)
    }

    fn remove(&self, remote: &RemoteLocation) -> Result<(), TransferError> {
        (**self).remove(remote)
    }
}

/// Transfers files with the `scp` and `ssh` command line tools.
#[derive(Debug, Clone)]
pub struct ScpTransfer {
    port: u16,
    identity_file: Option<PathBuf>,
    transfer_timeout: Duration,
    command_timeout: Duration,
}

impl Default for ScpTransfer {
    fn default() -> Self {
        Self {
            port: 22,
            identity_file: None,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl ScpTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, identity_file: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(identity_file.into());
        self
    }

    /// Limit for copying a single file.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Limit for listing, renaming and removing.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn scp(&self) -> Command {
        let mut command = Command::new("scp");
        command
            .arg("-q")
            .arg("-B")
            .arg("-P")
            .arg(self.port.to_string());
        if let Some(identity_file) = &self.identity_file {
            command.arg("-i").arg(identity_file);
        }
        command
    }

    fn ssh(&self, remote: &RemoteLocation, script: String) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(identity_file) = &self.identity_file {
            command.arg("-i").arg(identity_file);
        }
        command.arg(remote.user_at_host()).arg(script);
        command
    }
}

impl RemoteTransfer for ScpTransfer {
    fn push(&self, local: &Path, remote: &RemoteLocation) -> Result<(), TransferError> {
        if let Some((parent, _)) = remote.path.rsplit_once('/') {
            if !parent.is_empty() {
                let mkdir = format!("mkdir -p {}", shell_quote(parent));
                run(self.ssh(remote, mkdir), self.command_timeout)?;
            }
        }
        let mut scp = self.scp();
        scp.arg(local).arg(format!(
            "{}:{}",
            remote.user_at_host(),
            shell_quote(&remote.path)
        ));
        run(scp, self.transfer_timeout).map(|_| ())
    }

    fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<(), TransferError> {
        let mut scp = self.scp();
        scp.arg(format!(
            "{}:{}",
            remote.user_at_host(),
            shell_quote(&remote.path)
        ))
        .arg(local);
        run(scp, self.transfer_timeout).map(|_| ())
    }

    fn list(&self, remote: &RemoteLocation) -> Result<Vec<String>, TransferError> {
        let ls = format!("ls -1 {}", shell_quote(&remote.path));
        let stdout = run(self.ssh(remote, ls), self.command_timeout)?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn rename(&self, from: &RemoteLocation, to_path: &str) -> Result<(), TransferError> {
        let mv = format!("mv -f {} {}", shell_quote(&from.path), shell_quote(to_path));
        run(self.ssh(from, mv), self.command_timeout).map(|_| ())
    }

    fn remove(&self, remote: &RemoteLocation) -> Result<(), TransferError> {
        let rm = format!("rm -f {}", shell_quote(&remote.path));
        run(self.ssh(remote, rm), self.command_timeout).map(|_| ())
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn describe(command: &Command) -> String {
    let mut description = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        description.push(' ');
        description.push_str(&arg.to_string_lossy());
    }
    description
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            if let Err(err) = source.read_to_end(&mut buf) {
                debug!(error = %err, "cannot read subprocess output");
            }
        }
        buf
    })
}

/// Runs `command` to completion and returns its standard output, killing it after `timeout`.
fn run(mut command: Command, timeout: Duration) -> Result<Vec<u8>, TransferError> {
    let description = describe(&command);
    debug!(command = %description, "running");
    let mut child: Child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| TransferError::Spawn {
            command: description.clone(),
            source,
        })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= timeout => {
                if let Err(err) = child.kill() {
                    warn!(command = %description, error = %err, "cannot kill timed out command");
                }
                let _ = child.wait();
                return Err(TransferError::Timeout {
                    command: description,
                    timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                return Err(TransferError::Spawn {
                    command: description,
                    source,
                });
            }
        }
    };
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    if status.success() {
        Ok(stdout)
    } else {
        Err(TransferError::Failed {
            command: description,
            status: status.code(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_location_formatting() {
        let location = RemoteLocation::new("depot", "db1.example.org", "/var/lib/depot/t/Text/x");
        assert_eq!(location.to_string(), "depot@db1.example.org:/var/lib/depot/t/Text/x");
        assert_eq!(location.with_suffix(".temp").path, "/var/lib/depot/t/Text/x.temp");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_output_and_failure() {
        let mut echo = Command::new("sh");
        echo.arg("-c").arg("echo listed");
        assert_eq!(run(echo, Duration::from_secs(10)).unwrap(), b"listed\n");

        let mut fail = Command::new("sh");
        fail.arg("-c").arg("echo broken >&2; exit 3");
        match run(fail, Duration::from_secs(10)) {
            Err(TransferError::Failed { status, stderr, .. }) => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_times_out() {
        let mut sleep = Command::new("sh");
        sleep.arg("-c").arg("sleep 5");
        assert!(matches!(
            run(sleep, Duration::from_millis(100)),
            Err(TransferError::Timeout { .. })
        ));
    }
}
