//! Greenroom: session daemon for audio workstations
//!
//! Supervises application processes and keeps a model of the audio routing
//! graph. Everything lives in one [`Studio`] owned by one control loop:
//!
//! - **Supervisor**: app records, launch, level-based save and stop, signal delivery
//! - **Graph**: clients, ports and connections with visibility and identity
//! - **Command queue**: multi-step operations that wait on outside state
//! - **Projector**: mirrors the live audio server into the studio graph
//! - **Rooms**: detachable sub-scopes linked into the studio graph

pub mod commands;
pub mod cqueue;
pub mod daemon;
pub mod dict;
pub mod environment;
pub mod graph;
pub mod notify;
pub mod process;
pub mod project;
pub mod projector;
pub mod room;
pub mod server;
pub mod studio;
pub mod supervisor;
pub mod telemetry;

pub use cqueue::{Command, CommandQueue, CommandState, Step};
pub use daemon::{Call, Daemon, DaemonConfig, DaemonHandle};
pub use dict::Dict;
pub use graph::{ClientId, ConnectionId, Graph, GraphError, NewPort, PortId};
pub use notify::{BroadcastSink, NoOpSink, NotificationSink, RecordingSink, SharedSink};
pub use process::{Loader, NixProcessControl, NoRichProtocol, ProcessControl, RichProtocol, ShellLoader};
pub use project::{ProjectError, ProjectInfo};
pub use projector::GraphProjector;
pub use room::Room;
pub use server::{AudioServer, LivePort, ServerError, ServerEvent, ShellAudioServer, ShellCommands};
pub use studio::{Dispatch, SaveRequest, Studio, StudioError, StudioOptions};
pub use supervisor::{AppId, AppSupervisor, Level, ProcessHost, SupervisorError};
