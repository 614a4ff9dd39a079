//! The control loop.
//!
//! One task owns the [`Studio`] and the command queue. Calls, audio server
//! events, SIGCHLD and a pump tick are multiplexed with `select!`; the queue
//! is pumped after every wakeup.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use greenproto::{Reply, Request};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::commands::StartStudio;
use crate::cqueue::CommandQueue;
use crate::server::ServerEvent;
use crate::studio::{Dispatch, Studio};

const CALL_QUEUE_DEPTH: usize = 64;

/// A request and where its one reply goes.
#[derive(Debug)]
pub struct Call {
    pub request: Request,
    pub reply: oneshot::Sender<Reply>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pump_interval: Duration,
    /// Queue a studio start before the first call.
    pub autostart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pump_interval: Duration::from_millis(100),
            autostart: false,
        }
    }
}

/// Cloneable entry point for callers. The loop ends once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    calls: mpsc::Sender<Call>,
}

impl DaemonHandle {
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(Call { request, reply })
            .await
            .map_err(|_| anyhow!("daemon is not running"))?;
        rx.await.context("daemon dropped the call without a reply")
    }
}

pub struct Daemon {
    studio: Studio,
    queue: CommandQueue<Studio>,
    config: DaemonConfig,
    calls: mpsc::Receiver<Call>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Daemon {
    pub fn new(
        studio: Studio,
        config: DaemonConfig,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> (Self, DaemonHandle) {
        let (tx, calls) = mpsc::channel(CALL_QUEUE_DEPTH);
        let daemon = Self {
            studio,
            queue: CommandQueue::new(),
            config,
            calls,
            events,
        };
        (daemon, DaemonHandle { calls: tx })
    }

    /// Run until shutdown or until every handle is gone. Returns the studio
    /// after its apps were told to stop.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<Studio> {
        let mut sigchld = signal(SignalKind::child()).context("Failed to watch SIGCHLD")?;
        let mut tick = tokio::time::interval(self.config.pump_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(studio = %self.studio.name(), "greenroom daemon running");
        if self.config.autostart {
            self.queue.push(Box::new(StartStudio::new()), None);
        }

        loop {
            tokio::select! {
                call = self.calls.recv() => {
                    match call {
                        Some(call) => self.handle_call(call),
                        None => {
                            info!("all callers gone");
                            break;
                        }
                    }
                }

                Some(event) = self.events.recv() => {
                    self.studio.on_server_event(event);
                }

                _ = sigchld.recv() => {
                    debug!("SIGCHLD");
                    self.studio.reap_children();
                }

                _ = tick.tick() => {}

                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }

            self.queue.pump(&mut self.studio);
        }

        self.queue.cancel("daemon is shutting down");
        self.studio.shutdown();
        info!("greenroom daemon stopped");
        Ok(self.studio)
    }

    fn handle_call(&mut self, call: Call) {
        match self.studio.handle_request(call.request) {
            Dispatch::Reply(reply) => {
                if call.reply.send(reply).is_err() {
                    debug!("caller went away before the reply");
                }
            }
            Dispatch::Queue(command) => self.queue.push(command, Some(call.reply)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{RecordingSink, SharedSink};
    use crate::server::{AudioServer, LivePort, ServerError};
    use crate::studio::StudioOptions;
    use crate::supervisor::testing::{RecordingControl, ScriptedLoader, ScriptedRich};
    use crate::supervisor::ProcessHost;
    use greenproto::{Notification, Scope};
    use std::sync::Arc;

    /// Confirms start and stop right away.
    struct EagerServer {
        events: mpsc::UnboundedSender<ServerEvent>,
    }

    impl AudioServer for EagerServer {
        fn start(&self) -> Result<(), ServerError> {
            let _ = self.events.send(ServerEvent::Started);
            Ok(())
        }

        fn stop(&self) -> Result<(), ServerError> {
            let _ = self.events.send(ServerEvent::Stopped);
            Ok(())
        }

        fn connect(&self, _: &LivePort, _: &LivePort) -> Result<(), ServerError> {
            Ok(())
        }

        fn disconnect(&self, _: &LivePort, _: &LivePort) -> Result<(), ServerError> {
            Ok(())
        }
    }

    fn spawn(autostart: bool) -> (DaemonHandle, Arc<RecordingSink>, broadcast::Sender<()>, tokio::task::JoinHandle<Result<Studio>>) {
        let sink = RecordingSink::new();
        let shared: SharedSink = sink.clone();
        let host = ProcessHost {
            loader: ScriptedLoader::with_pids(&[1234]),
            control: RecordingControl::new(),
            rich: ScriptedRich::new(false),
            sink: shared,
            base_dir: std::env::temp_dir(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = Arc::new(EagerServer { events: events_tx });
        let options = StudioOptions {
            name: "test".into(),
            projects_dir: std::env::temp_dir(),
        };
        let studio = Studio::new(options, host, server);
        let config = DaemonConfig {
            pump_interval: Duration::from_millis(5),
            autostart,
        };
        let (daemon, handle) = Daemon::new(studio, config, events_rx);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(daemon.run(shutdown_rx));
        (handle, sink, shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_start_and_stop_studio() {
        let (handle, sink, shutdown, task) = spawn(false);

        assert_eq!(handle.call(Request::StartStudio).await.unwrap(), Reply::Ok);
        match handle.call(Request::GetStudioState).await.unwrap() {
            Reply::StudioState { started, .. } => assert!(started),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(handle.call(Request::StopStudio).await.unwrap(), Reply::Ok);
        let events = sink.events();
        assert!(events.contains(&Notification::StudioStarted));
        assert!(events.contains(&Notification::StudioStopped));
        assert!(!events.iter().any(|e| matches!(e, Notification::UserAlert { .. })));

        shutdown.send(()).unwrap();
        let studio = task.await.unwrap().unwrap();
        assert!(!studio.is_started());
    }

    #[tokio::test]
    async fn test_new_app_runs_once_studio_started() {
        let (handle, _sink, shutdown, task) = spawn(true);

        let reply = handle
            .call(Request::AddApp {
                scope: Scope::Studio,
                name: "synth".into(),
                commandline: "zynaddsubfx".into(),
                terminal: false,
                level: "0".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::AppCreated { id: 1 });

        let running = handle
            .call(Request::IsAppRunning {
                scope: Scope::Studio,
                id: 1,
            })
            .await
            .unwrap();
        assert_eq!(running, Reply::Running { running: true });

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_call_without_daemon_fails() {
        let (calls, rx) = mpsc::channel(1);
        drop(rx);
        let handle = DaemonHandle { calls };
        let err = tokio_test::block_on(handle.call(Request::GetStudioState)).unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn test_loop_ends_when_callers_are_gone() {
        let (handle, _sink, _shutdown, task) = spawn(false);
        drop(handle);
        let studio = task.await.unwrap().unwrap();
        assert_eq!(studio.running_app_count(), 0);
    }
}
