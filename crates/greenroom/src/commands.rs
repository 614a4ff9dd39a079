//! Queued studio commands.
//!
//! Each command keeps its own phase so a later pump resumes where the last
//! one stopped waiting.

use std::path::Path;

use greenproto::{Reply, RpcError, Scope};
use tracing::{error, info};

use crate::cqueue::{Command, Step};
use crate::studio::{SaveRequest, Studio, StudioError};
use crate::supervisor::{AppId, SupervisorError};

/// Start the audio server, then autorun every scope.
pub struct StartStudio {
    waiting: bool,
}

impl StartStudio {
    pub fn new() -> Self {
        Self { waiting: false }
    }

    fn step(&mut self, studio: &mut Studio) -> Result<Step, StudioError> {
        if !self.waiting {
            if studio.is_started() {
                info!("ignoring start request, studio is already started");
                return Ok(Step::Done(Reply::Ok));
            }

            let running = studio.running_app_count();
            if running != 0 {
                error!(running, "ignoring start request, apps are still running");
                return Err(StudioError::Conflict(format!(
                    "{} app(s) still running; the audio server probably stopped unexpectedly. \
                     Save your work, then unload and reload the studio.",
                    running
                )));
            }

            studio.request_server_start()?;
            self.waiting = true;
        }

        if let Some(reason) = studio.take_server_failure() {
            return Err(StudioError::ServerFailed(reason));
        }
        match studio.consume_server_change() {
            None => Ok(Step::Wait),
            Some(true) => {
                studio.on_server_started();
                Ok(Step::Done(Reply::Ok))
            }
            Some(false) => Err(StudioError::ServerFailed("stopped while starting".to_string())),
        }
    }
}

impl Default for StartStudio {
    fn default() -> Self {
        Self::new()
    }
}

impl Command<Studio> for StartStudio {
    fn name(&self) -> &'static str {
        "start studio"
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        self.step(studio).map_err(RpcError::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    Pending,
    WaitingForApps,
    WaitingForServer,
}

/// Stop every app, wait for them to exit, then stop the audio server.
pub struct StopStudio {
    phase: StopPhase,
}

impl StopStudio {
    pub fn new() -> Self {
        Self {
            phase: StopPhase::Pending,
        }
    }

    fn step(&mut self, studio: &mut Studio) -> Result<Step, StudioError> {
        loop {
            match self.phase {
                StopPhase::Pending => {
                    if !studio.is_started() {
                        info!("ignoring stop request, studio is not started");
                        return Ok(Step::Done(Reply::Ok));
                    }
                    info!("stopping apps");
                    studio.begin_stop();
                    self.phase = StopPhase::WaitingForApps;
                }
                StopPhase::WaitingForApps => {
                    if studio.running_app_count() != 0 {
                        return Ok(Step::Wait);
                    }
                    studio.request_server_stop()?;
                    self.phase = StopPhase::WaitingForServer;
                }
                StopPhase::WaitingForServer => {
                    if let Some(reason) = studio.take_server_failure() {
                        return Err(StudioError::ServerFailed(reason));
                    }
                    return match studio.consume_server_change() {
                        None => Ok(Step::Wait),
                        Some(false) => {
                            studio.mark_stopped();
                            Ok(Step::Done(Reply::Ok))
                        }
                        Some(true) => Err(StudioError::ServerFailed("started while stopping".to_string())),
                    };
                }
            }
        }
    }
}

impl Default for StopStudio {
    fn default() -> Self {
        Self::new()
    }
}

impl Command<Studio> for StopStudio {
    fn name(&self) -> &'static str {
        "stop studio"
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        self.step(studio).map_err(|e| {
            studio.abort_stop();
            RpcError::from(e)
        })
    }
}

/// Add an app and start it. Before the studio runs, the app is only
/// flagged to start with it.
pub struct NewApp {
    scope: Scope,
    name: String,
    commandline: String,
    terminal: bool,
    level: String,
}

impl NewApp {
    pub fn new(scope: Scope, name: String, commandline: String, terminal: bool, level: String) -> Self {
        Self {
            scope,
            name,
            commandline,
            terminal,
            level,
        }
    }

    /// An unnamed app is named after its executable.
    fn app_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        self.commandline
            .split_whitespace()
            .next()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.commandline.clone())
    }

    fn step(&mut self, studio: &mut Studio) -> Result<Step, StudioError> {
        let started = studio.is_started();
        let name = self.app_name();
        let supervisor = studio.supervisor_mut(&self.scope)?;
        let id = supervisor.add(&name, None, &self.commandline, self.terminal, &self.level, !started)?;

        if !started {
            info!(app.id = %id, app.name = %name, "studio not started, app will start with it");
            return Ok(Step::Done(Reply::AppCreated { id: id.0 }));
        }

        if let Err(e) = supervisor.start(id) {
            error!(app.id = %id, app.name = %name, "new app failed to start: {}", e);
            if let Err(e) = supervisor.remove(id) {
                error!(app.id = %id, "cannot drop app that failed to start: {}", e);
            }
            return Err(e.into());
        }
        Ok(Step::Done(Reply::AppCreated { id: id.0 }))
    }
}

impl Command<Studio> for NewApp {
    fn name(&self) -> &'static str {
        "new app"
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        self.step(studio).map_err(RpcError::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Start,
    Stop,
    Kill,
}

/// Start, stop or kill one app.
pub struct ChangeAppState {
    scope: Scope,
    id: AppId,
    action: AppAction,
}

impl ChangeAppState {
    pub fn new(scope: Scope, id: AppId, action: AppAction) -> Self {
        Self { scope, id, action }
    }

    fn step(&mut self, studio: &mut Studio) -> Result<Step, StudioError> {
        let supervisor = studio.supervisor_mut(&self.scope)?;
        let running = supervisor.is_running(self.id)?;

        match self.action {
            AppAction::Start => supervisor.start(self.id)?,
            AppAction::Stop | AppAction::Kill if !running => {
                info!(app.id = %self.id, action = ?self.action, "app is not running");
            }
            AppAction::Stop => supervisor.stop(self.id)?,
            AppAction::Kill => supervisor.kill(self.id)?,
        }
        Ok(Step::Done(Reply::Ok))
    }
}

impl Command<Studio> for ChangeAppState {
    fn name(&self) -> &'static str {
        match self.action {
            AppAction::Start => "start app",
            AppAction::Stop => "stop app",
            AppAction::Kill => "kill app",
        }
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        self.step(studio).map_err(RpcError::from)
    }
}

/// Stop an app if needed, wait for it to exit, then forget it.
pub struct RemoveApp {
    scope: Scope,
    id: AppId,
    stop_sent: bool,
}

impl RemoveApp {
    pub fn new(scope: Scope, id: AppId) -> Self {
        Self {
            scope,
            id,
            stop_sent: false,
        }
    }

    fn step(&mut self, studio: &mut Studio) -> Result<Step, StudioError> {
        let supervisor = studio.supervisor_mut(&self.scope)?;
        let app = supervisor
            .find_by_id(self.id)
            .ok_or(SupervisorError::NotFound(self.id))?;

        if app.is_running() {
            if !self.stop_sent {
                info!(app.id = %self.id, app.name = %app.name, "stopping app before removal");
                supervisor.stop(self.id)?;
                self.stop_sent = true;
            }
            return Ok(Step::Wait);
        }

        supervisor.remove(self.id)?;
        Ok(Step::Done(Reply::Ok))
    }
}

impl Command<Studio> for RemoveApp {
    fn name(&self) -> &'static str {
        "remove app"
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        self.step(studio).map_err(RpcError::from)
    }
}

/// Save every app of a scope and write its project file.
pub struct SaveProject {
    scope: Scope,
    request: Option<SaveRequest>,
}

impl SaveProject {
    pub fn new(scope: Scope, request: SaveRequest) -> Self {
        Self {
            scope,
            request: Some(request),
        }
    }
}

impl Command<Studio> for SaveProject {
    fn name(&self) -> &'static str {
        "save project"
    }

    fn run(&mut self, studio: &mut Studio) -> Result<Step, RpcError> {
        let request = self.request.take().unwrap_or_default();
        let (path, uuid) = studio.save_project(&self.scope, request)?;
        Ok(Step::Done(Reply::ProjectSaved {
            path: path.display().to_string(),
            uuid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_app(name: &str, commandline: &str) -> NewApp {
        NewApp::new(Scope::Studio, name.into(), commandline.into(), false, "0".into())
    }

    #[test]
    fn test_unnamed_app_takes_program_name() {
        assert_eq!(new_app("", "/usr/bin/qsynth -a jack").app_name(), "qsynth");
        assert_eq!(new_app("  ", "hydrogen").app_name(), "hydrogen");
        assert_eq!(new_app("drums", "hydrogen").app_name(), "drums");
    }

    #[test]
    fn test_command_names() {
        let kill = ChangeAppState::new(Scope::Studio, AppId(1), AppAction::Kill);
        assert_eq!(kill.name(), "kill app");
        assert_eq!(StopStudio::new().name(), "stop studio");
    }
}
