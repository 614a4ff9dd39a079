//! App supervisor
//!
//! One supervisor per scope (the studio, each room). It owns the app records,
//! launches them through the [`Loader`], and stops, kills or asks them to save
//! according to their level.
//!
//! Observable mutations bump `version` and then publish exactly one
//! notification carrying the new value.

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use greenproto::{AppSummary, Notification, Scope, Urgency};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notify::SharedSink;
use crate::process::{LaunchError, LaunchRequest, Loader, ProcessControl, RichProtocol};

/// Longest accepted level string, in bytes.
pub const MAX_LEVEL_LEN: usize = 11;

/// Subdirectory of a scope dir holding rich-protocol app state.
pub const RICH_APPS_DIR: &str = "rich_apps";

/// Informed when a supervised app is renamed, before the rename commits.
pub trait AppRenamer {
    fn app_renamed(&mut self, app: Uuid, old_name: &str, new_name: &str);
}

impl<F: FnMut(Uuid, &str, &str)> AppRenamer for F {
    fn app_renamed(&mut self, app: Uuid, old_name: &str, new_name: &str) {
        self(app, old_name, new_name)
    }
}

/// How much an app cooperates with saving and stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    /// Plain process: no save, SIGTERM to stop.
    Zero,
    /// Saves on SIGUSR1.
    One,
    /// Speaks the rich protocol over a registered endpoint.
    Rich,
}

impl Level {
    /// Integer form used by older peers.
    pub fn as_integer(self) -> u8 {
        match self {
            Level::Zero => 0,
            Level::One => 1,
            Level::Rich => 2,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Zero => write!(f, "0"),
            Level::One => write!(f, "1"),
            Level::Rich => write!(f, "lash"),
        }
    }
}

impl FromStr for Level {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_LEVEL_LEN {
            return Err(SupervisorError::InvalidLevel(s.to_string()));
        }
        match s {
            "0" => Ok(Level::Zero),
            "1" => Ok(Level::One),
            "lash" => Ok(Level::Rich),
            other => Err(SupervisorError::InvalidLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Stopped,
    Started,
    Stopping,
    Kill,
}

/// Per-scope app id. Starts at 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub u64);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid level '{0}'")]
    InvalidLevel(String),

    #[error("app with id {0} not found")]
    NotFound(AppId),

    #[error("{0}")]
    Conflict(String),

    #[error("failed to start app: {0}")]
    Launch(#[from] LaunchError),
}

/// A supervised application.
#[derive(Debug, Clone)]
pub struct App {
    pub id: AppId,
    pub uuid: Uuid,
    pub name: String,
    pub commandline: String,
    pub terminal: bool,
    pub level: Level,
    /// 0 while not running.
    pub pid: i32,
    /// Cached process group of `pid`, 0 when unknown.
    pub pgrp: i32,
    /// First descendant seen registering with the audio server.
    pub firstborn_pid: i32,
    pub firstborn_pgrp: i32,
    pub firstborn_refcount: u32,
    /// Remove instead of marking stopped when the process exits.
    pub zombie: bool,
    /// Start again on the next autorun pass.
    pub autorun: bool,
    pub state: AppState,
    /// Registered rich-protocol endpoint.
    pub endpoint: Option<String>,
}

impl App {
    pub fn is_running(&self) -> bool {
        self.pid != 0
    }

    fn summary(&self) -> AppSummary {
        AppSummary {
            id: self.id.0,
            name: self.name.clone(),
            running: self.is_running(),
            terminal: self.terminal,
            level: self.level.to_string(),
        }
    }
}

/// New values for [`AppSupervisor::set_properties`].
#[derive(Debug, Clone)]
pub struct AppUpdate {
    pub name: String,
    pub commandline: String,
    pub terminal: bool,
    pub level: String,
}

/// External collaborators shared by every supervisor of a studio.
#[derive(Clone)]
pub struct ProcessHost {
    pub loader: Arc<dyn Loader>,
    pub control: Arc<dyn ProcessControl>,
    pub rich: Arc<dyn RichProtocol>,
    pub sink: SharedSink,
    /// Where rich-protocol state goes for scopes without a directory.
    pub base_dir: PathBuf,
}

pub struct AppSupervisor {
    name: String,
    scope: Scope,
    dir: Option<PathBuf>,
    project_name: Option<String>,
    version: u64,
    next_id: u64,
    apps: Vec<App>,
    host: ProcessHost,
}

impl AppSupervisor {
    pub fn new(name: impl Into<String>, scope: Scope, host: ProcessHost) -> Self {
        Self {
            name: name.into(),
            scope,
            dir: None,
            project_name: None,
            version: 0,
            next_id: 1,
            apps: Vec::new(),
            host,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn set_directory(&mut self, dir: Option<PathBuf>) {
        self.dir = dir;
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    pub fn set_project_name(&mut self, name: Option<String>) {
        self.project_name = name;
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn emit_added(&mut self, pos: usize) {
        self.version += 1;
        let app = &self.apps[pos];
        self.host.sink.publish(Notification::AppAdded {
            scope: self.scope.clone(),
            version: self.version,
            id: app.id.0,
            name: app.name.clone(),
            running: app.is_running(),
            terminal: app.terminal,
            level: app.level.to_string(),
        });
    }

    fn emit_state_changed(&mut self, pos: usize) {
        self.version += 1;
        let app = &self.apps[pos];
        self.host.sink.publish(Notification::AppStateChanged {
            scope: self.scope.clone(),
            version: self.version,
            id: app.id.0,
            name: app.name.clone(),
            running: app.is_running(),
            terminal: app.terminal,
            level: app.level.to_string(),
        });
    }

    fn remove_at(&mut self, pos: usize) {
        let app = self.apps.remove(pos);
        debug_assert_eq!(app.pid, 0);
        self.version += 1;
        self.host.sink.publish(Notification::AppRemoved {
            scope: self.scope.clone(),
            version: self.version,
            id: app.id.0,
        });
        info!(scope = %self.scope, app.id = %app.id, app.name = %app.name, "app removed");
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Apps in insertion order.
    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.apps.iter()
    }

    pub fn find_by_id(&self, id: AppId) -> Option<&App> {
        self.apps.iter().find(|a| a.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.name == name)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<&App> {
        if pid == 0 {
            return None;
        }
        self.apps.iter().find(|a| a.pid == pid)
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<&App> {
        self.apps.iter().find(|a| a.uuid == uuid)
    }

    fn pos(&self, id: AppId) -> Result<usize, SupervisorError> {
        self.apps
            .iter()
            .position(|a| a.id == id)
            .ok_or(SupervisorError::NotFound(id))
    }

    pub fn is_running(&self, id: AppId) -> Result<bool, SupervisorError> {
        let pos = self.pos(id)?;
        Ok(self.apps[pos].is_running())
    }

    /// Version plus one summary row per app.
    pub fn list(&self) -> (u64, Vec<AppSummary>) {
        (self.version, self.apps.iter().map(App::summary).collect())
    }

    pub fn running_count(&self) -> usize {
        self.apps.iter().filter(|a| a.is_running()).count()
    }

    pub fn has_apps(&self) -> bool {
        !self.apps.is_empty()
    }

    /// Ordered walk with early exit.
    pub fn enumerate(&self, mut f: impl FnMut(&App) -> ControlFlow<()>) -> ControlFlow<()> {
        for app in &self.apps {
            f(app)?;
        }
        ControlFlow::Continue(())
    }

    pub fn dump(&self) {
        debug!(
            scope = %self.scope,
            version = self.version,
            dir = ?self.dir,
            project = ?self.project_name,
            "supervisor '{}' dump",
            self.name
        );
        for app in &self.apps {
            debug!(
                "  app {} '{}' {:?} level={} pid={} pgrp={} firstborn={}/{}x{} zombie={} autorun={} cmd='{}'",
                app.id,
                app.name,
                app.state,
                app.level,
                app.pid,
                app.pgrp,
                app.firstborn_pid,
                app.firstborn_pgrp,
                app.firstborn_refcount,
                app.zombie,
                app.autorun,
                app.commandline
            );
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a new, stopped app. A nil or missing UUID gets a fresh one.
    pub fn add(
        &mut self,
        name: &str,
        uuid: Option<Uuid>,
        commandline: &str,
        terminal: bool,
        level: &str,
        autorun: bool,
    ) -> Result<AppId, SupervisorError> {
        let level: Level = level.parse()?;

        let id = AppId(self.next_id);
        self.next_id += 1;

        self.apps.push(App {
            id,
            uuid: uuid.filter(|u| !u.is_nil()).unwrap_or_else(Uuid::new_v4),
            name: name.to_string(),
            commandline: commandline.to_string(),
            terminal,
            level,
            pid: 0,
            pgrp: 0,
            firstborn_pid: 0,
            firstborn_pgrp: 0,
            firstborn_refcount: 0,
            zombie: false,
            autorun,
            state: AppState::Stopped,
            endpoint: None,
        });
        self.emit_added(self.apps.len() - 1);
        info!(scope = %self.scope, app.id = %id, app.name = name, %level, "app added");
        Ok(id)
    }

    /// Forget a stopped app.
    pub fn remove(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        if self.apps[pos].is_running() {
            return Err(SupervisorError::Conflict(format!(
                "app '{}' is still running",
                self.apps[pos].name
            )));
        }
        self.remove_at(pos);
        Ok(())
    }

    pub fn start(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        let app = &mut self.apps[pos];
        app.zombie = false;
        if app.is_running() {
            return Err(SupervisorError::Conflict(format!(
                "app '{}' is already running",
                app.name
            )));
        }

        let request = LaunchRequest {
            supervisor: &self.name,
            project: self.project_name.as_deref(),
            app: &app.name,
            working_dir: self.dir.as_deref().unwrap_or(Path::new("/")),
            terminal: app.terminal,
            commandline: &app.commandline,
        };
        let pid = self.host.loader.execute(&request)?;

        let app = &mut self.apps[pos];
        app.pid = pid;
        app.state = AppState::Started;
        self.emit_state_changed(pos);
        Ok(())
    }

    /// Ask a running app to stop according to its level.
    /// No-op for an app that is not running.
    pub fn stop(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        if !self.apps[pos].is_running() {
            debug!(app.id = %id, "stop of app that is not running ignored");
            return Ok(());
        }
        self.initiate_stop(pos);
        Ok(())
    }

    /// No-op for an app that is not running.
    pub fn kill(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        if !self.apps[pos].is_running() {
            debug!(app.id = %id, "kill of app that is not running ignored");
            return Ok(());
        }
        let control = self.host.control.clone();
        let app = &mut self.apps[pos];
        deliver_signal(control.as_ref(), app, Signal::SIGKILL, false);
        app.state = AppState::Kill;
        Ok(())
    }

    pub fn save(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        self.initiate_save(pos);
        Ok(())
    }

    /// Rich-protocol apps reload their state if a save exists.
    pub fn restore(&mut self, id: AppId) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        let app = &self.apps[pos];
        let Some(endpoint) = app.endpoint.as_deref().filter(|_| app.level == Level::Rich) else {
            return Ok(());
        };

        let dir = self.rich_dir(app.uuid);
        if !dir.is_dir() {
            info!(app.name = %app.name, dir = %dir.display(), "no saved state to restore");
            return Ok(());
        }
        if self.host.rich.restore(endpoint, &dir) {
            info!(app.name = %app.name, endpoint, dir = %dir.display(), "restore initiated");
        }
        Ok(())
    }

    fn rich_dir(&self, uuid: Uuid) -> PathBuf {
        self.dir
            .as_deref()
            .unwrap_or(&self.host.base_dir)
            .join(RICH_APPS_DIR)
            .join(uuid.to_string())
    }

    fn initiate_save(&mut self, pos: usize) {
        let app = &self.apps[pos];
        match (app.level, app.endpoint.clone()) {
            (Level::Rich, Some(endpoint)) => {
                let dir = self.rich_dir(app.uuid);
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    error!(app.name = %app.name, dir = %dir.display(), "cannot create save dir: {}", e);
                    return;
                }
                if self.host.rich.save(&endpoint, &dir) {
                    info!(app.name = %app.name, %endpoint, dir = %dir.display(), "save initiated");
                }
            }
            (Level::One, _) => {
                let control = self.host.control.clone();
                deliver_signal(control.as_ref(), &mut self.apps[pos], Signal::SIGUSR1, true);
            }
            _ => {}
        }
    }

    fn initiate_stop(&mut self, pos: usize) {
        let rich = self.host.rich.clone();
        let control = self.host.control.clone();
        let app = &mut self.apps[pos];

        let quit_accepted = match (app.level, &app.endpoint) {
            (Level::Rich, Some(endpoint)) => rich.quit(endpoint),
            _ => false,
        };
        if quit_accepted {
            info!(app.name = %app.name, "quit requested over rich protocol");
        } else {
            deliver_signal(control.as_ref(), app, Signal::SIGTERM, false);
        }
        app.state = AppState::Stopping;
    }

    /// A process exited. Returns whether it belonged to this supervisor.
    pub fn child_exit(&mut self, pid: i32) -> bool {
        let Some(pos) = self.apps.iter().position(|a| pid != 0 && a.pid == pid) else {
            return false;
        };

        let app = &mut self.apps[pos];
        info!(scope = %self.scope, app.name = %app.name, pid, "app exited");
        app.pid = 0;
        app.pgrp = 0;
        // firstborn is refcounted through add_pid/del_pid and left alone here

        if app.zombie {
            self.remove_at(pos);
            return true;
        }

        if app.state == AppState::Started {
            self.host.sink.publish(Notification::UserAlert {
                urgency: Urgency::High,
                title: "App terminated unexpectedly".to_string(),
                body: app.name.clone(),
            });
        }
        app.state = AppState::Stopped;
        self.emit_state_changed(pos);
        true
    }

    /// Start every app flagged autorun, clearing the flag first.
    /// Stops at the first app that fails to start.
    pub fn autorun(&mut self) -> Result<(), SupervisorError> {
        let pending: Vec<AppId> = self
            .apps
            .iter()
            .filter(|a| a.autorun)
            .map(|a| a.id)
            .collect();

        for id in pending {
            let pos = self.pos(id)?;
            self.apps[pos].autorun = false;
            info!(scope = %self.scope, app.name = %self.apps[pos].name, "autorun");
            if let Err(e) = self.start(id) {
                error!(scope = %self.scope, app.id = %id, "autorun failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop everything running and remember it for the next autorun.
    pub fn stop_all(&mut self) {
        for pos in 0..self.apps.len() {
            if self.apps[pos].is_running() {
                self.apps[pos].autorun = true;
                self.initiate_stop(pos);
            }
        }
    }

    /// Save every started app.
    pub fn save_all(&mut self) {
        for pos in 0..self.apps.len() {
            let app = &self.apps[pos];
            if app.state == AppState::Started && app.is_running() {
                self.initiate_save(pos);
            }
        }
    }

    /// Forget dir and project name; stop running apps and remove them on
    /// exit, remove the rest now. True when nothing is left running.
    pub fn clear(&mut self) -> bool {
        self.dir = None;
        self.project_name = None;

        let mut lifeless = true;
        let mut pos = 0;
        while pos < self.apps.len() {
            if self.apps[pos].is_running() {
                info!(app.name = %self.apps[pos].name, "terminating");
                self.initiate_stop(pos);
                self.apps[pos].zombie = true;
                lifeless = false;
                pos += 1;
            } else {
                self.remove_at(pos);
            }
        }
        lifeless
    }

    /// Change name, commandline, terminal flag and level.
    ///
    /// Only the name may change while the app runs. The renamer hears about
    /// a new name before it is committed.
    pub fn set_properties(
        &mut self,
        id: AppId,
        update: AppUpdate,
        renamer: &mut dyn AppRenamer,
    ) -> Result<(), SupervisorError> {
        let level: Level = update.level.parse()?;
        let pos = self.pos(id)?;
        let app = &self.apps[pos];

        if app.is_running() {
            if app.commandline != update.commandline {
                return Err(SupervisorError::Conflict(format!(
                    "Cannot change commandline when app is running. '{}' -> '{}'",
                    app.commandline, update.commandline
                )));
            }
            if app.terminal != update.terminal {
                return Err(SupervisorError::Conflict(
                    "Cannot change whether to run in terminal when app is running".to_string(),
                ));
            }
            if app.level != level {
                return Err(SupervisorError::Conflict(
                    "Cannot change app level when app is running".to_string(),
                ));
            }
        }

        if app.name != update.name {
            renamer.app_renamed(app.uuid, &app.name, &update.name);
        }

        let app = &mut self.apps[pos];
        app.name = update.name;
        app.commandline = update.commandline;
        app.terminal = update.terminal;
        app.level = level;
        self.emit_state_changed(pos);
        Ok(())
    }

    pub fn set_endpoint(&mut self, id: AppId, endpoint: Option<String>) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        self.apps[pos].endpoint = endpoint;
        Ok(())
    }

    /// A descendant of the app showed up with its own pid.
    pub fn add_pid(&mut self, id: AppId, pid: i32) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        let app = &mut self.apps[pos];

        if !app.is_running() {
            return Err(SupervisorError::Conflict(format!(
                "cannot associate pid {} with stopped app '{}'",
                pid, app.name
            )));
        }
        if pid <= 1 {
            error!(app.name = %app.name, pid, "refusing to track pid");
            return Ok(());
        }
        if pid == app.pid {
            return Ok(());
        }

        if app.firstborn_pid != 0 {
            if app.firstborn_pid == pid {
                app.firstborn_refcount += 1;
            }
            return Ok(());
        }

        debug!(app.name = %app.name, pid, "firstborn");
        app.firstborn_pid = pid;
        app.firstborn_refcount = 1;
        Ok(())
    }

    pub fn del_pid(&mut self, id: AppId, pid: i32) -> Result<(), SupervisorError> {
        let pos = self.pos(id)?;
        let app = &mut self.apps[pos];
        if app.firstborn_pid == 0 || app.firstborn_pid != pid {
            return Ok(());
        }

        app.firstborn_refcount = app.firstborn_refcount.saturating_sub(1);
        if app.firstborn_refcount == 0 {
            debug!(app.name = %app.name, pid, "firstborn gone");
            app.firstborn_pid = 0;
            app.firstborn_pgrp = 0;
        }
        Ok(())
    }
}

/// Resolve a process group, treating "no such process" as unknown.
fn resolve_pgrp(control: &dyn ProcessControl, pid: i32, what: &str) -> i32 {
    match control.getpgid(pid) {
        Ok(pgrp) => pgrp,
        Err(Errno::ESRCH) => 0,
        Err(e) => {
            error!(pid, "getpgid failed ({}): {}", what, e);
            0
        }
    }
}

/// Deliver `signal` to an app.
///
/// SIGTERM and SIGKILL go to process groups when known: the app's group,
/// plus the firstborn's group when that is a different one. Everything else,
/// or a group-less app, gets a plain kill, optionally aimed at the firstborn.
/// Nothing is ever sent to pid or group 0 or 1.
pub(crate) fn deliver_signal(
    control: &dyn ProcessControl,
    app: &mut App,
    signal: Signal,
    prefer_firstborn: bool,
) {
    if app.pid == 0 {
        error!(app.name = %app.name, %signal, "not signalling app without pid");
        return;
    }

    if matches!(signal, Signal::SIGTERM | Signal::SIGKILL) {
        if app.pgrp == 0 {
            app.pgrp = resolve_pgrp(control, app.pid, "app");
        }
        if app.firstborn_pid != 0 {
            app.firstborn_pgrp = resolve_pgrp(control, app.firstborn_pid, "firstborn");
        }

        if app.pgrp != 0 {
            if app.pgrp <= 1 {
                error!(app.name = %app.name, pgrp = app.pgrp, "refusing to signal process group");
                return;
            }
            info!(app.name = %app.name, pgrp = app.pgrp, %signal, "signalling process group");
            if let Err(e) = control.killpg(app.pgrp, signal) {
                warn!(app.name = %app.name, pgrp = app.pgrp, "killpg failed: {}", e);
            }

            if app.firstborn_pid == 0 {
                return;
            }
            if app.firstborn_pgrp != 0 {
                if app.firstborn_pgrp <= 1 {
                    error!(app.name = %app.name, pgrp = app.firstborn_pgrp, "refusing to signal firstborn group");
                    return;
                }
                if app.firstborn_pgrp != app.pgrp {
                    info!(app.name = %app.name, pgrp = app.firstborn_pgrp, %signal, "signalling firstborn group");
                    if let Err(e) = control.killpg(app.firstborn_pgrp, signal) {
                        warn!(app.name = %app.name, pgrp = app.firstborn_pgrp, "killpg failed: {}", e);
                    }
                }
                return;
            }
            // firstborn group unknown: also signal the pid directly
        }
    }

    if app.pid <= 1 {
        error!(app.name = %app.name, pid = app.pid, "refusing to signal pid");
        return;
    }
    let pid = if prefer_firstborn && app.firstborn_pid != 0 {
        app.firstborn_pid
    } else {
        app.pid
    };
    if pid <= 1 {
        error!(app.name = %app.name, pid, "refusing to signal pid");
        return;
    }

    info!(app.name = %app.name, pid, %signal, "signalling process");
    if let Err(e) = control.kill(pid, signal) {
        warn!(app.name = %app.name, pid, "kill failed: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators for supervisor and studio tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Kill(i32, Signal),
        KillPg(i32, Signal),
    }

    /// Hands out scripted pids; fails when none are left.
    #[derive(Default)]
    pub struct ScriptedLoader {
        pub pids: Mutex<Vec<i32>>,
        pub launched: Mutex<Vec<(String, String, PathBuf)>>,
    }

    impl ScriptedLoader {
        pub fn with_pids(pids: &[i32]) -> Arc<Self> {
            let mut pids = pids.to_vec();
            pids.reverse();
            Arc::new(Self {
                pids: Mutex::new(pids),
                launched: Mutex::new(Vec::new()),
            })
        }
    }

    impl Loader for ScriptedLoader {
        fn execute(&self, request: &LaunchRequest<'_>) -> Result<i32, LaunchError> {
            let pid = self.pids.lock().unwrap().pop().ok_or_else(|| LaunchError::Spawn {
                app: request.app.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
            self.launched.lock().unwrap().push((
                request.app.to_string(),
                request.commandline.to_string(),
                request.working_dir.to_path_buf(),
            ));
            Ok(pid)
        }
    }

    /// Records signals; process groups come from a table.
    #[derive(Default)]
    pub struct RecordingControl {
        pub groups: Mutex<HashMap<i32, i32>>,
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingControl {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_group(&self, pid: i32, pgrp: i32) {
            self.groups.lock().unwrap().insert(pid, pgrp);
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ProcessControl for RecordingControl {
        fn getpgid(&self, pid: i32) -> nix::Result<i32> {
            self.groups.lock().unwrap().get(&pid).copied().ok_or(Errno::ESRCH)
        }

        fn killpg(&self, pgrp: i32, signal: Signal) -> nix::Result<()> {
            self.sent.lock().unwrap().push(Sent::KillPg(pgrp, signal));
            Ok(())
        }

        fn kill(&self, pid: i32, signal: Signal) -> nix::Result<()> {
            self.sent.lock().unwrap().push(Sent::Kill(pid, signal));
            Ok(())
        }

        fn has_exited(&self, _pid: i32) -> bool {
            false
        }
    }

    /// Accepts or refuses every rich-protocol call.
    #[derive(Default)]
    pub struct ScriptedRich {
        pub accept: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRich {
        pub fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl RichProtocol for ScriptedRich {
        fn save(&self, endpoint: &str, dir: &Path) -> bool {
            self.calls.lock().unwrap().push(format!("save {} {}", endpoint, dir.display()));
            self.accept
        }

        fn restore(&self, endpoint: &str, dir: &Path) -> bool {
            self.calls.lock().unwrap().push(format!("restore {} {}", endpoint, dir.display()));
            self.accept
        }

        fn quit(&self, endpoint: &str) -> bool {
            self.calls.lock().unwrap().push(format!("quit {}", endpoint));
            self.accept
        }
    }
}
