//! Thin command runner used for every external tool invocation.
//!
//! # Example
//!
//! ```rust,ignore
//! use rescue_builder::process::Cmd;
//!
//! let result = Cmd::new("xz")
//!     .args(["-T0", "-c"])
//!     .arg_path(&input)
//!     .error_msg("xz failed. Install xz-utils.")
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::interrupt::Interrupt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder around [`std::process::Command`] with uniform error reporting.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    interrupt: Option<Interrupt>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
            interrupt: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Kill the child and fail when the flag is raised while waiting.
    pub fn interruptible(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    fn describe(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().to_string()));
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CommandResult> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning '{}'", self.describe()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait(&mut child)?;

        let result = CommandResult {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.describe()));
            bail!(
                "{} (status {}): {}",
                msg,
                result.status,
                result.stderr.trim()
            );
        }
        Ok(result)
    }

    /// Run with inherited stdio so the user sees progress.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning '{}'", self.describe()))?;

        let status = self.wait(&mut child)?;

        if !status.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.describe()));
            bail!("{} (status {})", msg, status);
        }
        Ok(status)
    }

    /// Poll `child` until it exits, killing it if the interrupt flag is raised.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for '{}'", self.describe()))?
            {
                return Ok(status);
            }
            if self.interrupt.as_ref().is_some_and(Interrupt::is_set) {
                let _ = child.kill();
                let _ = child.wait();
                bail!("'{}' interrupted", self.describe());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).to_string())
        .unwrap_or_default()
}
