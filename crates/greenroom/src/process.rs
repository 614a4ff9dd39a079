//! Process seams: launching apps, signalling them, reaping them.
//!
//! The supervisor only talks to the traits here. The nix-backed
//! implementations are what the daemon runs with; tests substitute their own.

use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, Pid};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything the loader needs to start one app.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    /// Name of the supervising scope (studio or room).
    pub supervisor: &'a str,
    pub project: Option<&'a str>,
    pub app: &'a str,
    pub working_dir: &'a Path,
    pub terminal: bool,
    pub commandline: &'a str,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{app}': {source}")]
    Spawn {
        app: String,
        source: std::io::Error,
    },

    #[error("empty terminal command for '{0}'")]
    NoTerminal(String),
}

/// Starts app processes. Returns the pid of the launched process.
pub trait Loader: Send + Sync {
    fn execute(&self, request: &LaunchRequest<'_>) -> Result<i32, LaunchError>;
}

/// Signal delivery and process-group lookup.
pub trait ProcessControl: Send + Sync {
    fn getpgid(&self, pid: i32) -> nix::Result<i32>;
    fn killpg(&self, pgrp: i32, signal: Signal) -> nix::Result<()>;
    fn kill(&self, pid: i32, signal: Signal) -> nix::Result<()>;
    /// Non-blocking reap of one direct child. True once it is gone.
    fn has_exited(&self, pid: i32) -> bool;
}

/// Control channel of apps speaking the rich save/restore/quit protocol.
///
/// Every call returns whether the request was accepted by the app.
pub trait RichProtocol: Send + Sync {
    fn save(&self, endpoint: &str, dir: &Path) -> bool;
    fn restore(&self, endpoint: &str, dir: &Path) -> bool;
    fn quit(&self, endpoint: &str) -> bool;
}

/// Real process control via nix.
pub struct NixProcessControl;

impl ProcessControl for NixProcessControl {
    fn getpgid(&self, pid: i32) -> nix::Result<i32> {
        getpgid(Some(Pid::from_raw(pid))).map(Pid::as_raw)
    }

    fn killpg(&self, pgrp: i32, signal: Signal) -> nix::Result<()> {
        signal::killpg(Pid::from_raw(pgrp), signal)
    }

    fn kill(&self, pid: i32, signal: Signal) -> nix::Result<()> {
        signal::kill(Pid::from_raw(pid), signal)
    }

    fn has_exited(&self, pid: i32) -> bool {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(WaitStatus::Exited(_, code)) => {
                info!(pid, code, "child exited");
                true
            }
            Ok(WaitStatus::Signaled(_, sig, core)) => {
                info!(pid, signal = %sig, core, "child killed by signal");
                true
            }
            Ok(other) => {
                debug!(pid, status = ?other, "child status change");
                false
            }
            // Not our child (any more): nothing left to wait for.
            Err(Errno::ECHILD) => true,
            Err(e) => {
                warn!(pid, "waitpid failed: {}", e);
                false
            }
        }
    }
}

/// Refuses every rich-protocol request, so stop falls back to SIGTERM.
///
/// For daemons built without an endpoint transport.
pub struct NoRichProtocol;

impl RichProtocol for NoRichProtocol {
    fn save(&self, endpoint: &str, dir: &Path) -> bool {
        debug!(endpoint, dir = %dir.display(), "rich save not available");
        false
    }

    fn restore(&self, endpoint: &str, dir: &Path) -> bool {
        debug!(endpoint, dir = %dir.display(), "rich restore not available");
        false
    }

    fn quit(&self, endpoint: &str) -> bool {
        debug!(endpoint, "rich quit not available");
        false
    }
}

/// Launches apps through a shell, each in its own process group.
pub struct ShellLoader {
    shell: String,
    terminal: Vec<String>,
}

impl ShellLoader {
    /// `terminal` is a command prefix such as `xterm -e`.
    pub fn new(shell: impl Into<String>, terminal: &str) -> Self {
        Self {
            shell: shell.into(),
            terminal: terminal.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn command(&self, request: &LaunchRequest<'_>) -> Result<Command, LaunchError> {
        let mut command = if request.terminal {
            let (program, prefix) = self
                .terminal
                .split_first()
                .ok_or_else(|| LaunchError::NoTerminal(request.app.to_string()))?;
            let mut command = Command::new(program);
            command
                .args(prefix)
                .arg(&self.shell)
                .arg("-c")
                .arg(request.commandline);
            command
        } else {
            let mut command = Command::new(&self.shell);
            command.arg("-c").arg(request.commandline);
            command
        };

        command
            .current_dir(request.working_dir)
            .env("GREENROOM_SUPERVISOR", request.supervisor)
            .env("GREENROOM_APP_NAME", request.app)
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(project) = request.project {
            command.env("GREENROOM_PROJECT", project);
        }
        Ok(command)
    }
}

impl Loader for ShellLoader {
    fn execute(&self, request: &LaunchRequest<'_>) -> Result<i32, LaunchError> {
        let spawn_err = |source| LaunchError::Spawn {
            app: request.app.to_string(),
            source,
        };

        let mut command = self.command(request)?;

        // stdout belongs to the transport; app output goes to our stderr
        let stderr = std::io::stderr()
            .as_fd()
            .try_clone_to_owned()
            .map_err(spawn_err)?;
        let stdout = stderr.try_clone().map_err(spawn_err)?;
        command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        let child = command.spawn().map_err(spawn_err)?;
        let pid = child.id() as i32;
        info!(
            app.name = request.app,
            pid,
            dir = %request.working_dir.display(),
            terminal = request.terminal,
            "launched: {}",
            request.commandline
        );
        // Reaped later through ProcessControl::has_exited.
        drop(child);
        Ok(pid)
    }
}

/// Parent pid from `/proc/<pid>/stat`.
pub fn parent_pid(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_ppid(&stat)
}

/// The comm field may contain spaces and parens; fields resume after the last ')'.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Walk up the process tree from `pid` until `is_known` matches.
pub fn find_ancestor(pid: i32, mut is_known: impl FnMut(i32) -> bool) -> Option<i32> {
    let mut current = pid;
    while current > 1 {
        if is_known(current) {
            return Some(current);
        }
        current = parent_pid(current)?;
    }
    None
}
