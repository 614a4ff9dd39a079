//! End-to-end tests of the studio and its command queue.
//!
//! Collaborators are in-memory fakes: pids come from a script, signals are
//! recorded, and the audio server only records what it was asked to do.
//! Server feed events and child exits are injected by hand.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use greenproto::{ErrorKind, Notification, PortType, Reply, Request, Scope, Urgency};
use greenroom::process::{LaunchError, LaunchRequest};
use greenroom::supervisor::AppState;
use greenroom::{
    AppId, AudioServer, CommandQueue, Dispatch, LivePort, Loader, NoRichProtocol, ProcessControl, ProcessHost,
    RecordingSink, ServerError, ServerEvent, SharedSink, Studio, StudioOptions,
};
use nix::sys::signal::Signal;
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

struct ScriptLoader {
    pids: Mutex<VecDeque<i32>>,
}

impl Loader for ScriptLoader {
    fn execute(&self, request: &LaunchRequest<'_>) -> Result<i32, LaunchError> {
        self.pids.lock().unwrap().pop_front().ok_or_else(|| LaunchError::Spawn {
            app: request.app.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

/// Every process leads its own group.
#[derive(Default)]
struct SignalLog {
    sent: Mutex<Vec<(i32, Signal)>>,
}

impl SignalLog {
    fn sent(&self) -> Vec<(i32, Signal)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ProcessControl for SignalLog {
    fn getpgid(&self, pid: i32) -> nix::Result<i32> {
        Ok(pid)
    }

    fn killpg(&self, pgrp: i32, signal: Signal) -> nix::Result<()> {
        self.sent.lock().unwrap().push((pgrp, signal));
        Ok(())
    }

    fn kill(&self, pid: i32, signal: Signal) -> nix::Result<()> {
        self.sent.lock().unwrap().push((pid, signal));
        Ok(())
    }

    fn has_exited(&self, _pid: i32) -> bool {
        false
    }
}

#[derive(Default)]
struct ServerLog {
    calls: Mutex<Vec<&'static str>>,
}

impl ServerLog {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl AudioServer for ServerLog {
    fn start(&self) -> Result<(), ServerError> {
        self.calls.lock().unwrap().push("start");
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.calls.lock().unwrap().push("stop");
        Ok(())
    }

    fn connect(&self, _: &LivePort, _: &LivePort) -> Result<(), ServerError> {
        self.calls.lock().unwrap().push("connect");
        Ok(())
    }

    fn disconnect(&self, _: &LivePort, _: &LivePort) -> Result<(), ServerError> {
        self.calls.lock().unwrap().push("disconnect");
        Ok(())
    }
}

struct Harness {
    studio: Studio,
    queue: CommandQueue<Studio>,
    sink: Arc<RecordingSink>,
    signals: Arc<SignalLog>,
    server: Arc<ServerLog>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(pids: &[i32]) -> Self {
        let sink = RecordingSink::new();
        let shared: SharedSink = sink.clone();
        let signals = Arc::new(SignalLog::default());
        let server = Arc::new(ServerLog::default());
        let dir = tempfile::tempdir().unwrap();

        let host = ProcessHost {
            loader: Arc::new(ScriptLoader {
                pids: Mutex::new(pids.iter().copied().collect()),
            }),
            control: signals.clone(),
            rich: Arc::new(NoRichProtocol),
            sink: shared,
            base_dir: dir.path().join("state"),
        };
        let options = StudioOptions {
            name: "studio".into(),
            projects_dir: dir.path().join("projects"),
        };
        let studio = Studio::new(options, host, server.clone());

        Self {
            studio,
            queue: CommandQueue::new(),
            sink,
            signals,
            server,
            dir,
        }
    }

    /// Dispatch without pumping.
    fn enqueue(&mut self, request: Request) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        match self.studio.handle_request(request) {
            Dispatch::Reply(reply) => {
                let _ = tx.send(reply);
            }
            Dispatch::Queue(command) => self.queue.push(command, Some(tx)),
        }
        rx
    }

    fn pump(&mut self) {
        self.queue.pump(&mut self.studio);
    }

    /// Dispatch and pump once, like one loop iteration.
    fn submit(&mut self, request: Request) -> oneshot::Receiver<Reply> {
        let rx = self.enqueue(request);
        self.pump();
        rx
    }

    fn server_event(&mut self, event: ServerEvent) {
        self.studio.on_server_event(event);
        self.pump();
    }

    fn child_exit(&mut self, pid: i32) {
        assert!(self.studio.on_child_exit(pid), "pid {} not owned", pid);
        self.pump();
    }

    fn start_studio(&mut self) {
        let mut start = self.submit(Request::StartStudio);
        self.server_event(ServerEvent::Started);
        assert_eq!(start.try_recv().unwrap(), Reply::Ok);
        assert!(self.studio.is_started());
    }

    fn add_app(&mut self, name: &str) -> u64 {
        let mut rx = self.submit(Request::AddApp {
            scope: Scope::Studio,
            name: name.into(),
            commandline: format!("/usr/bin/{}", name),
            terminal: false,
            level: "0".into(),
        });
        match rx.try_recv().unwrap() {
            Reply::AppCreated { id } => id,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn app_state(&self, id: u64) -> (i32, AppState, u64) {
        let supervisor = self.studio.supervisor(&Scope::Studio).unwrap();
        let app = supervisor.find_by_id(AppId(id)).unwrap();
        (app.pid, app.state, supervisor.version())
    }
}

fn error_kind(reply: Reply) -> ErrorKind {
    match reply {
        Reply::Error { error } => error.kind,
        other => panic!("expected an error, got {:?}", other),
    }
}

#[test]
fn test_app_versions_follow_lifecycle() {
    let mut h = Harness::new(&[1234]);

    let id = h.add_app("foo");
    assert_eq!(id, 1);
    assert_eq!(h.app_state(id), (0, AppState::Stopped, 1));

    let mut start = h.submit(Request::StartApp { scope: Scope::Studio, id });
    assert_eq!(start.try_recv().unwrap(), Reply::Ok);
    assert_eq!(h.app_state(id), (1234, AppState::Started, 2));

    h.child_exit(1234);
    assert_eq!(h.app_state(id), (0, AppState::Stopped, 3));

    let events = h.sink.events();
    let versions: Vec<(u64, bool)> = events
        .iter()
        .filter_map(|e| match e {
            Notification::AppAdded { version, running, .. } => Some((*version, *running)),
            Notification::AppStateChanged { version, running, .. } => Some((*version, *running)),
            _ => None,
        })
        .collect();
    assert_eq!(versions, vec![(1, false), (2, true), (3, false)]);
    assert!(events
        .iter()
        .any(|e| matches!(e, Notification::UserAlert { urgency: Urgency::High, .. })));
}

#[test]
fn test_start_studio_waits_for_server_and_autoruns() {
    let mut h = Harness::new(&[2000]);
    let id = h.add_app("synth");
    assert_eq!(h.app_state(id).0, 0);

    let mut start = h.submit(Request::StartStudio);
    assert!(start.try_recv().is_err());
    assert_eq!(h.server.calls(), vec!["start"]);
    assert!(!h.studio.is_started());

    h.server_event(ServerEvent::Started);
    assert_eq!(start.try_recv().unwrap(), Reply::Ok);
    assert!(h.studio.is_started());
    assert_eq!(h.app_state(id).0, 2000);
    assert!(h.sink.events().contains(&Notification::StudioStarted));

    // a second start is a no-op
    let mut again = h.submit(Request::StartStudio);
    assert_eq!(again.try_recv().unwrap(), Reply::Ok);
    assert_eq!(h.server.calls(), vec!["start"]);
}

#[test]
fn test_waiting_start_holds_back_new_app() {
    let mut h = Harness::new(&[2100]);
    let mut start = h.submit(Request::StartStudio);
    let mut add = h.submit(Request::AddApp {
        scope: Scope::Studio,
        name: "synth".into(),
        commandline: "zynaddsubfx".into(),
        terminal: false,
        level: "1".into(),
    });
    assert!(add.try_recv().is_err());
    assert!(!h.studio.supervisor(&Scope::Studio).unwrap().has_apps());

    h.server_event(ServerEvent::Started);
    assert_eq!(start.try_recv().unwrap(), Reply::Ok);
    assert_eq!(add.try_recv().unwrap(), Reply::AppCreated { id: 1 });
    // created after the studio started, so it runs right away
    assert_eq!(h.app_state(1).0, 2100);
}

#[test]
fn test_failed_server_start() {
    let mut h = Harness::new(&[]);
    let mut start = h.submit(Request::StartStudio);
    h.server_event(ServerEvent::Failed("start exited with 1".into()));

    assert_eq!(error_kind(start.try_recv().unwrap()), ErrorKind::Generic);
    assert!(!h.studio.is_started());
    assert!(h.queue.is_empty());
}

#[test]
fn test_start_with_stale_apps_cancels_the_queue() {
    let mut h = Harness::new(&[3000]);
    let supervisor = h.studio.supervisor_mut(&Scope::Studio).unwrap();
    let id = supervisor.add("orphan", None, "orphan", false, "0", false).unwrap();
    supervisor.start(id).unwrap();

    let mut start = h.enqueue(Request::StartStudio);
    let mut behind = h.enqueue(Request::StopApp { scope: Scope::Studio, id: id.0 });
    h.pump();

    assert_eq!(error_kind(start.try_recv().unwrap()), ErrorKind::StateConflict);
    match behind.try_recv().unwrap() {
        Reply::Error { error } => assert!(error.message.contains("cancelled")),
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(h.server.calls().is_empty());
    assert!(h.signals.sent().is_empty());
}

#[test]
fn test_remove_running_app_waits_for_exit() {
    let mut h = Harness::new(&[4000]);
    h.start_studio();
    let id = h.add_app("sampler");
    assert_eq!(h.app_state(id).0, 4000);

    let mut remove = h.submit(Request::RemoveApp { scope: Scope::Studio, id });
    assert!(remove.try_recv().is_err());
    assert_eq!(h.signals.sent(), vec![(4000, Signal::SIGTERM)]);
    assert_eq!(h.app_state(id).1, AppState::Stopping);

    // another pump must not signal again
    h.pump();
    assert_eq!(h.signals.sent().len(), 1);

    h.child_exit(4000);
    assert_eq!(remove.try_recv().unwrap(), Reply::Ok);
    assert!(!h.studio.supervisor(&Scope::Studio).unwrap().has_apps());
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, Notification::AppRemoved { id: removed, .. } if *removed == id)));
}

#[test]
fn test_stop_studio_then_restart_brings_apps_back() {
    let mut h = Harness::new(&[5000, 5001]);
    h.start_studio();
    let id = h.add_app("synth");

    let mut stop = h.submit(Request::StopStudio);
    assert!(stop.try_recv().is_err());
    assert_eq!(h.signals.sent(), vec![(5000, Signal::SIGTERM)]);
    assert_eq!(h.server.calls(), vec!["start"]);

    h.child_exit(5000);
    assert_eq!(h.server.calls(), vec!["start", "stop"]);
    assert!(stop.try_recv().is_err());

    h.server_event(ServerEvent::Stopped);
    assert_eq!(stop.try_recv().unwrap(), Reply::Ok);
    assert!(!h.studio.is_started());

    let events = h.sink.events();
    assert!(events.contains(&Notification::StudioStopped));
    // neither the app exit nor the server stop were unexpected
    assert!(!events.iter().any(|e| matches!(e, Notification::UserAlert { .. })));

    h.start_studio();
    assert_eq!(h.app_state(id).0, 5001);
}

#[test]
fn test_server_restart_during_stop_fails_the_stop() {
    let mut h = Harness::new(&[]);
    h.start_studio();

    let mut stop = h.submit(Request::StopStudio);
    assert_eq!(h.server.calls(), vec!["start", "stop"]);
    assert!(stop.try_recv().is_err());

    // stopped and back up before the queue got to look
    h.studio.on_server_event(ServerEvent::Stopped);
    h.server_event(ServerEvent::Started);

    assert_eq!(error_kind(stop.try_recv().unwrap()), ErrorKind::Generic);
    assert!(h.studio.is_started());
    assert!(h.queue.is_empty());
    assert!(!h.sink.events().contains(&Notification::StudioStopped));
}

#[test]
fn test_unknown_app_reports_invalid_args() {
    let mut h = Harness::new(&[]);
    let mut kill = h.submit(Request::KillApp { scope: Scope::Studio, id: 42 });
    assert_eq!(error_kind(kill.try_recv().unwrap()), ErrorKind::InvalidArgs);

    let mut props = h.submit(Request::GetAppProperties { scope: Scope::Studio, id: 42 });
    assert_eq!(error_kind(props.try_recv().unwrap()), ErrorKind::InvalidArgs);
}

#[test]
fn test_set_properties_conflicts_while_running() {
    let mut h = Harness::new(&[6000]);
    h.start_studio();
    let id = h.add_app("synth");

    let mut change = h.submit(Request::SetAppProperties {
        scope: Scope::Studio,
        id,
        name: "synth".into(),
        commandline: "/usr/bin/other".into(),
        terminal: false,
        level: "0".into(),
    });
    assert_eq!(error_kind(change.try_recv().unwrap()), ErrorKind::StateConflict);

    let mut rename = h.submit(Request::SetAppProperties {
        scope: Scope::Studio,
        id,
        name: "lead".into(),
        commandline: "/usr/bin/synth".into(),
        terminal: false,
        level: "0".into(),
    });
    assert_eq!(rename.try_recv().unwrap(), Reply::Ok);

    let mut props = h.submit(Request::GetAppProperties { scope: Scope::Studio, id });
    match props.try_recv().unwrap() {
        Reply::AppProperties { name, running, level, .. } => {
            assert_eq!(name, "lead");
            assert!(running);
            assert_eq!(level, "0");
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_save_room_project() {
    let mut h = Harness::new(&[]);
    let mut created = h.submit(Request::NewRoom { name: "drums".into() });
    assert_eq!(created.try_recv().unwrap(), Reply::Ok);
    let mut port = h.submit(Request::AddLinkPort {
        room: "drums".into(),
        name: "kick out".into(),
        port_type: PortType::Audio,
        is_input: false,
    });
    assert_eq!(port.try_recv().unwrap(), Reply::Ok);

    let scope = Scope::Room("drums".into());
    let supervisor = h.studio.supervisor_mut(&scope).unwrap();
    supervisor.add("hydrogen", None, "hydrogen -n", false, "0", false).unwrap();

    let mut save = h.submit(Request::SaveProject {
        scope: scope.clone(),
        dir: None,
        name: Some("drum session".into()),
        description: None,
        notes: Some("needs more cowbell".into()),
    });
    let path = match save.try_recv().unwrap() {
        Reply::ProjectSaved { path, .. } => std::path::PathBuf::from(path),
        other => panic!("unexpected reply {:?}", other),
    };

    assert_eq!(path.parent().unwrap(), h.dir.path().join("projects").join("drum session"));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("<?xml version=\"1.0\"?>"));
    assert!(text.contains("<project name=\"drum session\""));
    assert!(text.contains("kick out"));
    assert!(text.contains("needs more cowbell"));
    assert!(text.contains(">hydrogen -n</application>"));
    assert!(!path.with_extension("xml.tmp").exists());

    let info = h.studio.project(&scope).unwrap();
    assert_eq!(info.name.as_deref(), Some("drum session"));
}
