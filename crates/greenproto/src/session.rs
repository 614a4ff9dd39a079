//! Requests, replies and notifications of the session daemon.
//!
//! Supervisor calls and graph calls are addressed by [`Scope`]: either the
//! studio or one of its rooms. Every scope owns one app supervisor and one
//! graph, so the same scope value names both.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Addressing
// ============================================================================

/// Which supervisor/graph pair a call addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Studio,
    Room(String),
}

impl Scope {
    /// Object-path style name, used in logs and project files.
    pub fn path(&self) -> String {
        match self {
            Scope::Studio => "/studio".to_string(),
            Scope::Room(name) => format!("/room/{}", name),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// ============================================================================
// Graph vocabulary
// ============================================================================

/// Kind of data a port carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Audio,
    Midi,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Audio => write!(f, "audio"),
            PortType::Midi => write!(f, "midi"),
        }
    }
}

/// Direction and terminal-ness of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortFlags {
    #[serde(default)]
    pub input: bool,
    #[serde(default)]
    pub output: bool,
    /// Port is a physical endpoint (hardware) rather than a pass-through.
    #[serde(default)]
    pub terminal: bool,
}

impl PortFlags {
    pub const fn input() -> Self {
        Self {
            input: true,
            output: false,
            terminal: false,
        }
    }

    pub const fn output() -> Self {
        Self {
            input: false,
            output: true,
            terminal: false,
        }
    }

    pub const fn with_terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }
}

/// A visible port, as seen by peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub id: u64,
    pub name: String,
    pub port_type: PortType,
    pub flags: PortFlags,
}

/// A visible client with its visible ports, in registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub id: u64,
    pub name: String,
    pub ports: Vec<PortSnapshot>,
}

/// A visible connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub client1_id: u64,
    pub port1_id: u64,
    pub client2_id: u64,
    pub port2_id: u64,
}

/// Visible subset of one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u64,
    pub clients: Vec<ClientSnapshot>,
    pub connections: Vec<ConnectionSnapshot>,
    #[serde(default)]
    pub dict: BTreeMap<String, String>,
}

// ============================================================================
// Apps
// ============================================================================

/// One row of `ListApps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub id: u64,
    pub name: String,
    pub running: bool,
    pub terminal: bool,
    pub level: String,
}

/// Urgency of a user-facing alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

// ============================================================================
// Errors
// ============================================================================

/// Error category reported to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-vocabulary argument, or unknown id.
    InvalidArgs,
    /// The request conflicts with the current state (running app, stale processes).
    StateConflict,
    /// Anything else: launch failures, I/O, audio server refusals.
    Generic,
}

/// Error reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StateConflict, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }
}

// ============================================================================
// Requests & Replies
// ============================================================================

/// Calls a peer can make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    // App supervisor
    ListApps {
        #[serde(default)]
        scope: Scope,
    },
    AddApp {
        #[serde(default)]
        scope: Scope,
        name: String,
        commandline: String,
        #[serde(default)]
        terminal: bool,
        level: String,
    },
    StartApp {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    StopApp {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    KillApp {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    GetAppProperties {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    SetAppProperties {
        #[serde(default)]
        scope: Scope,
        id: u64,
        name: String,
        commandline: String,
        terminal: bool,
        level: String,
    },
    RemoveApp {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    IsAppRunning {
        #[serde(default)]
        scope: Scope,
        id: u64,
    },
    /// Register a rich-protocol control endpoint for the app owning `pid`.
    RegisterEndpoint {
        pid: i32,
        endpoint: String,
    },

    // Graph
    GetGraph {
        #[serde(default)]
        scope: Scope,
    },
    Connect {
        #[serde(default)]
        scope: Scope,
        port1: u64,
        port2: u64,
    },
    Disconnect {
        #[serde(default)]
        scope: Scope,
        connection_id: u64,
    },

    // Studio
    StartStudio,
    StopStudio,
    GetStudioState,
    SaveProject {
        #[serde(default)]
        scope: Scope,
        #[serde(default)]
        dir: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },

    // Rooms
    NewRoom {
        name: String,
    },
    DeleteRoom {
        name: String,
    },
    AttachRoom {
        name: String,
    },
    DetachRoom {
        name: String,
    },
    AddLinkPort {
        room: String,
        name: String,
        port_type: PortType,
        /// Input as seen from inside the room.
        is_input: bool,
    },
}

/// Replies to [`Request`]s. Every call gets exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Error {
        #[serde(flatten)]
        error: RpcError,
    },
    Apps {
        version: u64,
        apps: Vec<AppSummary>,
    },
    AppCreated {
        id: u64,
    },
    AppProperties {
        name: String,
        commandline: String,
        running: bool,
        terminal: bool,
        level: String,
    },
    Running {
        running: bool,
    },
    Graph {
        snapshot: GraphSnapshot,
    },
    Connected {
        connection_id: u64,
    },
    StudioState {
        name: String,
        started: bool,
        rooms: Vec<String>,
    },
    ProjectSaved {
        path: String,
        uuid: Uuid,
    },
}

impl From<RpcError> for Reply {
    fn from(error: RpcError) -> Self {
        Reply::Error { error }
    }
}

impl<E: Into<RpcError>> From<Result<Reply, E>> for Reply {
    fn from(result: Result<Reply, E>) -> Self {
        match result {
            Ok(reply) => reply,
            Err(e) => Reply::Error { error: e.into() },
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Broadcast to every peer.
///
/// App and graph notifications carry the version of their owner as it
/// stood right after the mutation they describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    AppAdded {
        scope: Scope,
        version: u64,
        id: u64,
        name: String,
        running: bool,
        terminal: bool,
        level: String,
    },
    AppRemoved {
        scope: Scope,
        version: u64,
        id: u64,
    },
    AppStateChanged {
        scope: Scope,
        version: u64,
        id: u64,
        name: String,
        running: bool,
        terminal: bool,
        level: String,
    },

    ClientAppeared {
        scope: Scope,
        version: u64,
        client_id: u64,
        name: String,
    },
    ClientRenamed {
        scope: Scope,
        version: u64,
        client_id: u64,
        old_name: String,
        new_name: String,
    },
    ClientDisappeared {
        scope: Scope,
        version: u64,
        client_id: u64,
    },
    PortAppeared {
        scope: Scope,
        version: u64,
        client_id: u64,
        port_id: u64,
        name: String,
        port_type: PortType,
        flags: PortFlags,
    },
    PortRenamed {
        scope: Scope,
        version: u64,
        client_id: u64,
        port_id: u64,
        old_name: String,
        new_name: String,
    },
    PortDisappeared {
        scope: Scope,
        version: u64,
        client_id: u64,
        port_id: u64,
    },
    PortsConnected {
        scope: Scope,
        version: u64,
        client1_id: u64,
        port1_id: u64,
        client2_id: u64,
        port2_id: u64,
        connection_id: u64,
    },
    PortsDisconnected {
        scope: Scope,
        version: u64,
        client1_id: u64,
        port1_id: u64,
        client2_id: u64,
        port2_id: u64,
        connection_id: u64,
    },

    StudioStarted,
    StudioStopped,
    RoomAppeared {
        name: String,
        uuid: Uuid,
    },
    RoomDisappeared {
        name: String,
    },
    ProjectPropertiesChanged {
        scope: Scope,
        name: String,
        dir: String,
    },
    UserAlert {
        urgency: Urgency,
        title: String,
        body: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scope_defaults_to_studio() {
        let req: Request = serde_json::from_str(r#"{"type":"list_apps"}"#).unwrap();
        assert_eq!(req, Request::ListApps { scope: Scope::Studio });
    }

    #[test]
    fn test_room_scope_wire_shape() {
        let req: Request =
            serde_json::from_str(r#"{"type":"start_app","scope":{"room":"drums"},"id":3}"#).unwrap();
        assert_eq!(
            req,
            Request::StartApp {
                scope: Scope::Room("drums".into()),
                id: 3
            }
        );
        assert_eq!(Scope::Room("drums".into()).path(), "/room/drums");
    }

    #[test]
    fn test_error_reply_is_flat() {
        let reply = Reply::from(RpcError::state_conflict("app is running"));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "state_conflict");
        assert_eq!(json["message"], "app is running");
    }

    #[test]
    fn test_app_state_changed_fields() {
        let event = Notification::AppStateChanged {
            scope: Scope::Studio,
            version: 2,
            id: 1,
            name: "synth".into(),
            running: true,
            terminal: false,
            level: "0".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "app_state_changed");
        assert_eq!(json["scope"], "studio");
        assert_eq!(json["running"], true);
    }
}
