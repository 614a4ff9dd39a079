//! The studio: one context object owned by the daemon loop.
//!
//! Holds the studio graph and supervisor, the rooms, the environment store
//! and the projector. Requests either get an immediate reply or become a
//! queued command; projected server events and child exits are routed here
//! so every mutation happens on the loop's task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use greenproto::{Notification, Reply, Request, RpcError, Scope, Urgency};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::commands::{AppAction, ChangeAppState, NewApp, RemoveApp, SaveProject, StartStudio, StopStudio};
use crate::cqueue::Command;
use crate::environment::{Environment, EnvironmentFact};
use crate::graph::{ConnectionId, Graph, GraphError, PortId};
use crate::process::find_ancestor;
use crate::project::{self, ProjectDocument, ProjectError, ProjectInfo};
use crate::projector::GraphProjector;
use crate::room::Room;
use crate::server::{AudioServer, ServerError, ServerEvent};
use crate::supervisor::{AppId, AppSupervisor, AppUpdate, Level, ProcessHost, SupervisorError};

#[derive(Debug, Error)]
pub enum StudioError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("audio server failed: {0}")]
    ServerFailed(String),

    #[error("room '{0}' not found")]
    NoSuchRoom(String),

    #[error("{0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Conflict(String),
}

impl From<StudioError> for RpcError {
    fn from(e: StudioError) -> Self {
        let message = e.to_string();
        match e {
            StudioError::Supervisor(SupervisorError::InvalidLevel(_) | SupervisorError::NotFound(_))
            | StudioError::Graph(
                GraphError::ClientNotFound(_)
                | GraphError::PortNotFound(_)
                | GraphError::ConnectionNotFound(_)
                | GraphError::SelfConnection(_),
            )
            | StudioError::Project(ProjectError::Unnamed(_) | ProjectError::BadDir(_))
            | StudioError::NoSuchRoom(_)
            | StudioError::InvalidArgs(_) => RpcError::invalid_args(message),

            StudioError::Supervisor(SupervisorError::Conflict(_))
            | StudioError::Graph(GraphError::AlreadyConnected { .. } | GraphError::NotVisible(_))
            | StudioError::Server(ServerError::NotRunning)
            | StudioError::Conflict(_) => RpcError::state_conflict(message),

            StudioError::Supervisor(SupervisorError::Launch(_))
            | StudioError::Project(ProjectError::Io { .. })
            | StudioError::Server(_)
            | StudioError::ServerFailed(_) => RpcError::generic(message),
        }
    }
}

/// Fields of a `SaveProject` request.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub dir: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StudioOptions {
    pub name: String,
    /// Base for project dirs derived from a name.
    pub projects_dir: PathBuf,
}

/// What the loop does with a request.
pub enum Dispatch {
    Reply(Reply),
    Queue(Box<dyn Command<Studio>>),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            Dispatch::Queue(command) => f.debug_tuple("Queue").field(&command.name()).finish(),
        }
    }
}

fn queue(command: impl Command<Studio> + 'static) -> Dispatch {
    Dispatch::Queue(Box::new(command))
}

fn find_room<'a>(rooms: &'a mut [Room], name: &str) -> Result<&'a mut Room, StudioError> {
    rooms
        .iter_mut()
        .find(|r| r.name() == name)
        .ok_or_else(|| StudioError::NoSuchRoom(name.to_string()))
}

pub struct Studio {
    name: String,
    started: bool,
    /// A StopStudio command is on its way; a server stop is expected.
    stopping: bool,
    server_failure: Option<String>,
    graph: Graph,
    supervisor: AppSupervisor,
    project: ProjectInfo,
    rooms: Vec<Room>,
    env: Environment,
    projector: GraphProjector,
    host: ProcessHost,
    server: Arc<dyn AudioServer>,
    projects_dir: PathBuf,
}

impl Studio {
    pub fn new(options: StudioOptions, host: ProcessHost, server: Arc<dyn AudioServer>) -> Self {
        let mut graph = Graph::new(Scope::Studio, host.sink.clone());
        graph.set_persist();
        let supervisor = AppSupervisor::new(options.name.clone(), Scope::Studio, host.clone());

        Self {
            name: options.name,
            started: false,
            stopping: false,
            server_failure: None,
            graph,
            supervisor,
            project: ProjectInfo::default(),
            rooms: Vec::new(),
            env: Environment::new(),
            projector: GraphProjector::new(),
            host,
            server,
            projects_dir: options.projects_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.name() == name)
    }

    pub fn project(&self, scope: &Scope) -> Result<&ProjectInfo, StudioError> {
        match scope {
            Scope::Studio => Ok(&self.project),
            Scope::Room(name) => self
                .room(name)
                .map(|r| &r.project)
                .ok_or_else(|| StudioError::NoSuchRoom(name.clone())),
        }
    }

    pub fn supervisor(&self, scope: &Scope) -> Result<&AppSupervisor, StudioError> {
        match scope {
            Scope::Studio => Ok(&self.supervisor),
            Scope::Room(name) => self
                .room(name)
                .map(|r| &r.supervisor)
                .ok_or_else(|| StudioError::NoSuchRoom(name.clone())),
        }
    }

    pub fn supervisor_mut(&mut self, scope: &Scope) -> Result<&mut AppSupervisor, StudioError> {
        match scope {
            Scope::Studio => Ok(&mut self.supervisor),
            Scope::Room(name) => find_room(&mut self.rooms, name).map(|r| &mut r.supervisor),
        }
    }

    pub fn graph_of(&self, scope: &Scope) -> Result<&Graph, StudioError> {
        match scope {
            Scope::Studio => Ok(&self.graph),
            Scope::Room(name) => self
                .room(name)
                .map(|r| &r.graph)
                .ok_or_else(|| StudioError::NoSuchRoom(name.clone())),
        }
    }

    fn graph_mut(&mut self, scope: &Scope) -> Result<&mut Graph, StudioError> {
        match scope {
            Scope::Studio => Ok(&mut self.graph),
            Scope::Room(name) => find_room(&mut self.rooms, name).map(|r| &mut r.graph),
        }
    }

    fn supervisors(&self) -> impl Iterator<Item = &AppSupervisor> {
        std::iter::once(&self.supervisor).chain(self.rooms.iter().map(|r| &r.supervisor))
    }

    fn supervisors_mut(&mut self) -> impl Iterator<Item = &mut AppSupervisor> {
        std::iter::once(&mut self.supervisor).chain(self.rooms.iter_mut().map(|r| &mut r.supervisor))
    }

    /// Running apps across the studio and every room.
    pub fn running_app_count(&self) -> usize {
        self.supervisors().map(AppSupervisor::running_count).sum()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn handle_request(&mut self, request: Request) -> Dispatch {
        debug!(?request, "request");
        match self.dispatch(request) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("request failed: {}", e);
                Dispatch::Reply(Reply::from(RpcError::from(e)))
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Dispatch, StudioError> {
        let reply = match request {
            Request::ListApps { scope } => {
                let (version, apps) = self.supervisor(&scope)?.list();
                Reply::Apps { version, apps }
            }
            Request::AddApp {
                scope,
                name,
                commandline,
                terminal,
                level,
            } => {
                // rejected before anything is queued
                level.parse::<Level>()?;
                self.supervisor(&scope)?;
                if commandline.trim().is_empty() {
                    return Err(StudioError::InvalidArgs("empty commandline".to_string()));
                }
                return Ok(queue(NewApp::new(scope, name, commandline, terminal, level)));
            }
            Request::StartApp { scope, id } => {
                return Ok(queue(ChangeAppState::new(scope, AppId(id), AppAction::Start)))
            }
            Request::StopApp { scope, id } => {
                return Ok(queue(ChangeAppState::new(scope, AppId(id), AppAction::Stop)))
            }
            Request::KillApp { scope, id } => {
                return Ok(queue(ChangeAppState::new(scope, AppId(id), AppAction::Kill)))
            }
            Request::RemoveApp { scope, id } => return Ok(queue(RemoveApp::new(scope, AppId(id)))),
            Request::GetAppProperties { scope, id } => {
                let app = self
                    .supervisor(&scope)?
                    .find_by_id(AppId(id))
                    .ok_or(SupervisorError::NotFound(AppId(id)))?;
                Reply::AppProperties {
                    name: app.name.clone(),
                    commandline: app.commandline.clone(),
                    running: app.is_running(),
                    terminal: app.terminal,
                    level: app.level.to_string(),
                }
            }
            Request::SetAppProperties {
                scope,
                id,
                name,
                commandline,
                terminal,
                level,
            } => {
                let update = AppUpdate {
                    name,
                    commandline,
                    terminal,
                    level,
                };
                // app clients live in the studio graph whatever the scope
                let Studio {
                    graph, supervisor, rooms, ..
                } = self;
                let supervisor = match &scope {
                    Scope::Studio => supervisor,
                    Scope::Room(room) => &mut find_room(rooms, room)?.supervisor,
                };
                supervisor.set_properties(AppId(id), update, graph)?;
                Reply::Ok
            }
            Request::IsAppRunning { scope, id } => Reply::Running {
                running: self.supervisor(&scope)?.is_running(AppId(id))?,
            },
            Request::RegisterEndpoint { pid, endpoint } => {
                let (scope, id) = self
                    .owner_of(pid)
                    .ok_or_else(|| StudioError::InvalidArgs(format!("no supervised app owns pid {}", pid)))?;
                info!(%scope, app.id = %id, pid, %endpoint, "control endpoint registered");
                self.supervisor_mut(&scope)?.set_endpoint(id, Some(endpoint))?;
                Reply::Ok
            }

            Request::GetGraph { scope } => Reply::Graph {
                snapshot: self.graph_of(&scope)?.snapshot(),
            },
            Request::Connect { scope, port1, port2 } => self.connect(&scope, PortId(port1), PortId(port2))?,
            Request::Disconnect { scope, connection_id } => {
                self.disconnect(&scope, ConnectionId(connection_id))?
            }

            Request::StartStudio => return Ok(queue(StartStudio::new())),
            Request::StopStudio => return Ok(queue(StopStudio::new())),
            Request::GetStudioState => Reply::StudioState {
                name: self.name.clone(),
                started: self.started,
                rooms: self.rooms.iter().map(|r| r.name().to_string()).collect(),
            },
            Request::SaveProject {
                scope,
                dir,
                name,
                description,
                notes,
            } => {
                self.supervisor(&scope)?;
                let request = SaveRequest {
                    dir,
                    name,
                    description,
                    notes,
                };
                return Ok(queue(SaveProject::new(scope, request)));
            }

            Request::NewRoom { name } => {
                self.new_room(&name)?;
                Reply::Ok
            }
            Request::DeleteRoom { name } => {
                self.delete_room(&name)?;
                Reply::Ok
            }
            Request::AttachRoom { name } => {
                let room = find_room(&mut self.rooms, &name)?;
                room.attach(&mut self.graph)?;
                Reply::Ok
            }
            Request::DetachRoom { name } => {
                let room = find_room(&mut self.rooms, &name)?;
                room.detach(&mut self.graph)?;
                Reply::Ok
            }
            Request::AddLinkPort {
                room,
                name,
                port_type,
                is_input,
            } => {
                if name.is_empty() {
                    return Err(StudioError::InvalidArgs("empty port name".to_string()));
                }
                let room = find_room(&mut self.rooms, &room)?;
                room.add_link_port(&mut self.graph, &name, port_type, is_input)?;
                Reply::Ok
            }
        };
        Ok(Dispatch::Reply(reply))
    }

    /// Live ports in the studio go through the server and show up once it
    /// confirms; everything else is a pure graph edit.
    fn connect(&mut self, scope: &Scope, port1: PortId, port2: PortId) -> Result<Reply, StudioError> {
        if *scope == Scope::Studio {
            let live = (
                self.projector.live_port(&self.graph, port1),
                self.projector.live_port(&self.graph, port2),
            );
            if let (Some(a), Some(b)) = live {
                if self.graph.find_connection(port1, port2).is_some() {
                    return Err(GraphError::AlreadyConnected { port1, port2 }.into());
                }
                if !self.started {
                    return Err(ServerError::NotRunning.into());
                }
                info!(port1 = %a.full_name, port2 = %b.full_name, "connect requested");
                self.server.connect(&a, &b)?;
                return Ok(Reply::Ok);
            }
        }

        let id = self.graph_mut(scope)?.add_connection(port1, port2, false)?;
        Ok(Reply::Connected {
            connection_id: id.0,
        })
    }

    fn disconnect(&mut self, scope: &Scope, id: ConnectionId) -> Result<Reply, StudioError> {
        if *scope == Scope::Studio {
            let (port1, port2) = self
                .graph
                .connection_ports(id)
                .ok_or(GraphError::ConnectionNotFound(id))?;
            let live = (
                self.projector.live_port(&self.graph, port1),
                self.projector.live_port(&self.graph, port2),
            );
            if let (Some(a), Some(b)) = live {
                if !self.started {
                    return Err(ServerError::NotRunning.into());
                }
                info!(port1 = %a.full_name, port2 = %b.full_name, "disconnect requested");
                self.server.disconnect(&a, &b)?;
                return Ok(Reply::Ok);
            }
        }

        self.graph_mut(scope)?.remove_connection(id, true)?;
        Ok(Reply::Ok)
    }

    fn new_room(&mut self, name: &str) -> Result<(), StudioError> {
        if name.is_empty() {
            return Err(StudioError::InvalidArgs("empty room name".to_string()));
        }
        if self.room(name).is_some() {
            return Err(StudioError::Conflict(format!("room '{}' already exists", name)));
        }
        let room = Room::new(name, &mut self.graph, self.host.clone(), self.host.sink.clone());
        self.rooms.push(room);
        Ok(())
    }

    fn delete_room(&mut self, name: &str) -> Result<(), StudioError> {
        let pos = self
            .rooms
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| StudioError::NoSuchRoom(name.to_string()))?;
        let running = self.rooms[pos].supervisor.running_count();
        if running > 0 {
            return Err(StudioError::Conflict(format!(
                "room '{}' still has {} running app(s)",
                name, running
            )));
        }
        let room = self.rooms.remove(pos);
        room.destroy(&mut self.graph, &self.host.sink)?;
        Ok(())
    }

    /// The supervised app owning `pid`, itself or through an ancestor.
    pub fn owner_of(&self, pid: i32) -> Option<(Scope, AppId)> {
        let lookup = |candidate: i32| {
            self.supervisors().find_map(|s| {
                s.apps()
                    .find(|a| a.pid == candidate || a.firstborn_pid == candidate)
                    .map(|a| (s.scope().clone(), a.id))
            })
        };
        let ancestor = find_ancestor(pid, |candidate| lookup(candidate).is_some())?;
        lookup(ancestor)
    }

    // ------------------------------------------------------------------
    // Audio server feed
    // ------------------------------------------------------------------

    pub fn on_server_event(&mut self, event: ServerEvent) {
        match &event {
            ServerEvent::Started => self.env.set(EnvironmentFact::AudioServerStarted, true),
            ServerEvent::Stopped => {
                let unexpected = self.started && !self.stopping;
                self.env.set(EnvironmentFact::AudioServerStarted, false);
                if unexpected {
                    self.server_stopped_unexpectedly();
                }
            }
            ServerEvent::Failed(reason) => self.server_failure = Some(reason.clone()),
            _ => {}
        }

        let vanishing_pid = match &event {
            ServerEvent::ClientDisappeared { id } => self.projector.client_pid(*id),
            _ => None,
        };

        if let Err(e) = self.projector.apply(&mut self.graph, &event) {
            warn!(?event, "cannot project server event: {}", e);
        }

        match event {
            ServerEvent::ClientAppeared { id, pid, .. } if pid > 0 => self.adopt_client(id, pid),
            ServerEvent::ClientDisappeared { .. } => {
                if let Some(pid) = vanishing_pid {
                    self.release_pid(pid);
                }
            }
            _ => {}
        }
    }

    fn server_stopped_unexpectedly(&mut self) {
        error!("audio server stopped unexpectedly");
        self.started = false;
        // nobody waits for this change
        self.env.consume_change(EnvironmentFact::AudioServerStarted);
        self.host.sink.publish(Notification::UserAlert {
            urgency: Urgency::High,
            title: "Audio server stopped unexpectedly".to_string(),
            body: "Save your work, then unload and reload the studio.".to_string(),
        });
        self.host.sink.publish(Notification::StudioStopped);
    }

    /// Link a live client to the app it descends from.
    fn adopt_client(&mut self, live_id: u64, pid: i32) {
        let Some((scope, app_id)) = self.owner_of(pid) else {
            debug!(live.id = live_id, pid, "client not started by any app");
            return;
        };
        let Some(client) = self.graph.find_client_by_live_id(live_id) else {
            return;
        };
        let Ok(supervisor) = self.supervisor_mut(&scope) else {
            return;
        };
        let Some(uuid) = supervisor.find_by_id(app_id).map(|a| a.uuid) else {
            return;
        };
        if let Err(e) = supervisor.add_pid(app_id, pid) {
            warn!(app.id = %app_id, pid, "cannot track client pid: {}", e);
        }
        if let Err(e) = self.graph.set_client_app(client, Some(uuid)) {
            warn!(live.id = live_id, "cannot link client to app: {}", e);
        }
        info!(%scope, app.id = %app_id, live.id = live_id, pid, "client linked to app");
    }

    fn release_pid(&mut self, pid: i32) {
        let Some((scope, app_id)) = self.owner_of(pid) else {
            return;
        };
        if let Ok(supervisor) = self.supervisor_mut(&scope) {
            if let Err(e) = supervisor.del_pid(app_id, pid) {
                debug!(app.id = %app_id, pid, "del_pid: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Child exits
    // ------------------------------------------------------------------

    /// Reap every app process that has exited.
    pub fn reap_children(&mut self) {
        let control = self.host.control.clone();
        let exited: Vec<i32> = self
            .supervisors()
            .flat_map(|s| s.apps().filter(|a| a.is_running()).map(|a| a.pid))
            .filter(|pid| control.has_exited(*pid))
            .collect();
        for pid in exited {
            self.on_child_exit(pid);
        }
    }

    /// Route one exit to the supervisor that owns the pid.
    pub fn on_child_exit(&mut self, pid: i32) -> bool {
        let owned = self.supervisors_mut().any(|s| s.child_exit(pid));
        if !owned {
            debug!(pid, "exit of a process no app owns");
        }
        owned
    }

    // ------------------------------------------------------------------
    // Studio lifecycle, driven by the start/stop commands
    // ------------------------------------------------------------------

    /// Ask the server to start, dropping any stale change first.
    pub(crate) fn request_server_start(&mut self) -> Result<(), StudioError> {
        self.server_failure = None;
        self.env.consume_change(EnvironmentFact::AudioServerStarted);
        info!(studio = %self.name, "starting audio server");
        self.graph.dump();
        self.server.start()?;
        Ok(())
    }

    pub(crate) fn request_server_stop(&mut self) -> Result<(), StudioError> {
        self.server_failure = None;
        info!(studio = %self.name, "stopping audio server");
        self.server.stop()?;
        Ok(())
    }

    pub(crate) fn consume_server_change(&mut self) -> Option<bool> {
        self.env.consume_change(EnvironmentFact::AudioServerStarted)
    }

    pub(crate) fn take_server_failure(&mut self) -> Option<String> {
        self.server_failure.take()
    }

    /// Server is up: mark started, autorun every scope, announce.
    pub(crate) fn on_server_started(&mut self) {
        self.started = true;
        info!(studio = %self.name, "studio started");
        for supervisor in self.supervisors_mut() {
            if let Err(e) = supervisor.autorun() {
                error!(scope = %supervisor.scope(), "autorun failed: {}", e);
            }
        }
        self.host.sink.publish(Notification::StudioStarted);
    }

    /// Stop every app and expect the server to go away.
    pub(crate) fn begin_stop(&mut self) {
        self.stopping = true;
        for supervisor in self.supervisors_mut() {
            supervisor.stop_all();
        }
    }

    pub(crate) fn abort_stop(&mut self) {
        self.stopping = false;
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.started = false;
        self.stopping = false;
        info!(studio = %self.name, "studio stopped");
        self.host.sink.publish(Notification::StudioStopped);
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Save apps, then write the project file of `scope`.
    pub fn save_project(&mut self, scope: &Scope, request: SaveRequest) -> Result<(PathBuf, Uuid), StudioError> {
        let projects_dir = self.projects_dir.clone();
        let sink = self.host.sink.clone();

        let (info, graph, supervisor, link_client) = match scope {
            Scope::Studio => (&mut self.project, &self.graph, &mut self.supervisor, None),
            Scope::Room(name) => {
                let room = find_room(&mut self.rooms, name)?;
                let link_client = room.link_client();
                (&mut room.project, &room.graph, &mut room.supervisor, Some(link_client))
            }
        };

        let (name, dir) = project::resolve_target(
            info,
            &scope.path(),
            request.dir.as_deref(),
            request.name.as_deref(),
            &projects_dir,
        )?;

        let previous_dir = supervisor.dir().map(Path::to_path_buf);
        let previous_name = supervisor.project_name().map(str::to_string);
        supervisor.set_directory(Some(dir.clone()));
        supervisor.set_project_name(Some(name.clone()));
        supervisor.save_all();

        let uuid = info.uuid.unwrap_or_else(Uuid::new_v4);
        let description = request.description.or_else(|| info.description.clone());
        let notes = request.notes.or_else(|| info.notes.clone());

        let document = ProjectDocument {
            name: &name,
            uuid,
            description: description.as_deref(),
            notes: notes.as_deref(),
            link_ports: link_client.map(|c| graph.client_ports(c)).unwrap_or_default(),
            graph,
            supervisor,
        };
        let contents = document.render(&project::ctime(&Local::now()));

        match project::write_atomic(&dir, &contents) {
            Ok(path) => {
                *info = ProjectInfo {
                    name: Some(name.clone()),
                    dir: Some(dir.clone()),
                    uuid: Some(uuid),
                    description,
                    notes,
                };
                sink.publish(Notification::ProjectPropertiesChanged {
                    scope: scope.clone(),
                    name,
                    dir: dir.display().to_string(),
                });
                Ok((path, uuid))
            }
            Err(e) => {
                error!(%scope, dir = %dir.display(), "project save failed: {}", e);
                supervisor.set_directory(previous_dir);
                supervisor.set_project_name(previous_name);
                Err(e.into())
            }
        }
    }

    /// Daemon exit: stop every app and drop the live objects.
    pub fn shutdown(&mut self) {
        info!(studio = %self.name, "shutting down");
        for supervisor in self.supervisors_mut() {
            if !supervisor.clear() {
                warn!(scope = %supervisor.scope(), "apps still running at shutdown");
            }
        }
        self.projector.shutdown(&mut self.graph);
    }
}
