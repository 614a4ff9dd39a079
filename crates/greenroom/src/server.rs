//! Live audio server seam: control calls out, change feed in.
//!
//! Control calls only request a change. Their outcome arrives later on the
//! [`ServerEvent`] feed, which the studio hands to the projector.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One entry of the live server's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started,
    Stopped,
    Failed(String),
    ClientAppeared {
        id: u64,
        name: String,
        /// 0 when the server does not know the client's process.
        pid: i32,
    },
    ClientDisappeared {
        id: u64,
    },
    PortAppeared {
        client_id: u64,
        port_id: u64,
        name: String,
        is_input: bool,
        is_terminal: bool,
        is_midi: bool,
    },
    PortDisappeared {
        client_id: u64,
        port_id: u64,
    },
    PortsConnected {
        port1_id: u64,
        port2_id: u64,
    },
    PortsDisconnected {
        port1_id: u64,
        port2_id: u64,
    },
}

/// A live port as the server addresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePort {
    pub id: u64,
    /// `client:port`
    pub full_name: String,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("audio server command is empty")]
    EmptyCommand,

    #[error("audio server is not running")]
    NotRunning,
}

/// Control surface of the live audio server.
pub trait AudioServer: Send + Sync {
    fn start(&self) -> Result<(), ServerError>;
    fn stop(&self) -> Result<(), ServerError>;
    fn connect(&self, port1: &LivePort, port2: &LivePort) -> Result<(), ServerError>;
    fn disconnect(&self, port1: &LivePort, port2: &LivePort) -> Result<(), ServerError>;
}

/// Commands used by [`ShellAudioServer`].
#[derive(Debug, Clone)]
pub struct ShellCommands {
    pub shell: String,
    pub start: String,
    pub stop: String,
    pub connect: String,
    pub disconnect: String,
}

/// Drives the server through configured shell commands.
///
/// Start and stop completion is reported on the feed from the exit status of
/// the command; connections are reported once their command succeeds. Must
/// be used from within a tokio runtime.
///
/// It never reports clients or ports. `ClientAppeared`, `PortAppeared` and
/// their removals need a feed that watches the live server's graph, so with
/// this server alone the studio graph only holds project, room and hardware
/// objects.
pub struct ShellAudioServer {
    commands: ShellCommands,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ShellAudioServer {
    pub fn new(commands: ShellCommands, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { commands, events }
    }

    /// Run `command` in the background, then send `on_success` or a failure.
    fn run(
        &self,
        what: &'static str,
        command: String,
        on_success: Option<ServerEvent>,
        failure_is_event: bool,
    ) -> Result<(), ServerError> {
        if command.trim().is_empty() {
            return Err(ServerError::EmptyCommand);
        }
        let shell = self.commands.shell.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            debug!(what, "running: {}", command);
            let status = Command::new(&shell)
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .status()
                .await;

            let outcome = match status {
                Ok(status) if status.success() => {
                    info!(what, "audio server command succeeded");
                    on_success
                }
                Ok(status) => {
                    warn!(what, %status, "audio server command failed: {}", command);
                    failure_is_event.then(|| ServerEvent::Failed(format!("{} exited with {}", what, status)))
                }
                Err(e) => {
                    warn!(what, "cannot run audio server command '{}': {}", command, e);
                    failure_is_event.then(|| ServerEvent::Failed(format!("{}: {}", what, e)))
                }
            };
            if let Some(event) = outcome {
                if events.send(event).is_err() {
                    debug!(what, "server event dropped, feed closed");
                }
            }
        });
        Ok(())
    }
}

fn with_ports(command: &str, port1: &LivePort, port2: &LivePort) -> String {
    format!(
        "{} {} {}",
        command,
        shell_quote(&port1.full_name),
        shell_quote(&port2.full_name)
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl AudioServer for ShellAudioServer {
    fn start(&self) -> Result<(), ServerError> {
        self.run("start", self.commands.start.clone(), Some(ServerEvent::Started), true)
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.run("stop", self.commands.stop.clone(), Some(ServerEvent::Stopped), true)
    }

    fn connect(&self, port1: &LivePort, port2: &LivePort) -> Result<(), ServerError> {
        let event = ServerEvent::PortsConnected {
            port1_id: port1.id,
            port2_id: port2.id,
        };
        self.run("connect", with_ports(&self.commands.connect, port1, port2), Some(event), false)
    }

    fn disconnect(&self, port1: &LivePort, port2: &LivePort) -> Result<(), ServerError> {
        let event = ServerEvent::PortsDisconnected {
            port1_id: port1.id,
            port2_id: port2.id,
        };
        self.run("disconnect", with_ports(&self.commands.disconnect, port1, port2), Some(event), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn commands(start: &str) -> ShellCommands {
        ShellCommands {
            shell: "/bin/sh".into(),
            start: start.into(),
            stop: "true".into(),
            connect: "true".into(),
            disconnect: "false".into(),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Option<ServerEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[test]
    fn test_ports_are_quoted() {
        let a = LivePort { id: 1, full_name: "system:capture_1".into() };
        let b = LivePort { id: 2, full_name: "it's:in".into() };
        assert_eq!(
            with_ports("jack_connect", &a, &b),
            r"jack_connect 'system:capture_1' 'it'\''s:in'"
        );
    }

    #[tokio::test]
    async fn test_start_reports_started() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ShellAudioServer::new(commands("true"), tx);
        server.start().unwrap();
        assert_eq!(next(&mut rx).await, Some(ServerEvent::Started));
    }

    #[tokio::test]
    async fn test_start_failure_reports_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ShellAudioServer::new(commands("exit 3"), tx);
        server.start().unwrap();
        assert!(matches!(next(&mut rx).await, Some(ServerEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_connect_confirms_by_live_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ShellAudioServer::new(commands("true"), tx);
        let a = LivePort { id: 7, full_name: "a:out".into() };
        let b = LivePort { id: 9, full_name: "b:in".into() };
        server.connect(&a, &b).unwrap();
        assert_eq!(
            next(&mut rx).await,
            Some(ServerEvent::PortsConnected { port1_id: 7, port2_id: 9 })
        );
    }

    #[tokio::test]
    async fn test_failed_disconnect_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ShellAudioServer::new(commands("true"), tx);
        let a = LivePort { id: 7, full_name: "a:out".into() };
        let b = LivePort { id: 9, full_name: "b:in".into() };
        server.disconnect(&a, &b).unwrap();
        server.stop().unwrap();
        // only the stop confirmation arrives
        assert_eq!(next(&mut rx).await, Some(ServerEvent::Stopped));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = ShellAudioServer::new(commands("  "), tx);
        assert!(matches!(server.start(), Err(ServerError::EmptyCommand)));
    }
}
