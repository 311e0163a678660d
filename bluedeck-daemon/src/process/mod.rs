/*!
 * Process Control
 * Helper program launch, scoped child ownership and scratch files
 */

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BluetoothError, Result};

/// A program invocation: argv plus extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Inherits the daemon environment, overlaid with `env`.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Launches helper programs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run to completion and capture stdout; a non-zero exit is an error.
    async fn output(&self, spec: &CommandSpec) -> Result<String>;

    /// Start a long-running child owned by the returned handle.
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>>;
}

/// An owned child. Dropping the handle kills the process.
#[async_trait]
pub trait ChildProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Ask the child to exit and wait for it.
    async fn terminate(&mut self) -> Result<()>;
}

pub struct SystemLauncher {
    grace: Duration,
}

impl SystemLauncher {
    /// `grace` bounds the wait between SIGTERM and SIGKILL.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn output(&self, spec: &CommandSpec) -> Result<String> {
        debug!("Running {}", spec);
        let output = spec
            .command()
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BluetoothError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BluetoothError::ProcessFailed {
                program: spec.program.clone(),
                status: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>> {
        let child = spec
            .command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BluetoothError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        debug!("Spawned {} (pid {:?})", spec, child.id());

        Ok(Box::new(ManagedChild {
            program: spec.program.clone(),
            child,
            grace: self.grace,
        }))
    }
}

struct ManagedChild {
    program: String,
    child: Child,
    grace: Duration,
}

#[async_trait]
impl ChildProcess for ManagedChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<()> {
        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal {} (pid {}): {}", self.program, pid, e);
        }

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => {
                debug!("{} (pid {}) exited: {}", self.program, pid, status?);
            }
            Err(_) => {
                warn!(
                    "{} (pid {}) ignored SIGTERM for {:?}, killing",
                    self.program, pid, self.grace
                );
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// A uniquely named file that is removed when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(dir: &Path, extension: &str) -> Self {
        Self {
            path: dir.join(format!("bluedeck-{}.{}", Uuid::new_v4(), extension)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed scratch file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}
