//! Rooms: named sub-scopes with their own graph and supervisor.
//!
//! In the studio graph a room is one client whose ports mirror the room's
//! link ports. Each studio-side port carries the UUID of its room-side twin
//! as link override, so connections keep resolving across detach/attach.
//! Detaching hides the studio client; attaching shows it again.

use greenproto::{Notification, PortFlags, PortType, Scope};
use tracing::info;
use uuid::Uuid;

use crate::graph::{ClientId, Graph, GraphError, NewPort, Port, PortId};
use crate::notify::SharedSink;
use crate::project::ProjectInfo;
use crate::supervisor::{AppSupervisor, ProcessHost};

pub struct Room {
    name: String,
    uuid: Uuid,
    pub graph: Graph,
    pub supervisor: AppSupervisor,
    pub project: ProjectInfo,
    /// Room-side holder of the link ports.
    link_client: ClientId,
    /// This room as seen from the studio graph.
    studio_client: ClientId,
}

impl Room {
    /// Create the room and its studio-side client.
    pub fn new(name: &str, studio: &mut Graph, host: ProcessHost, sink: SharedSink) -> Self {
        let uuid = Uuid::new_v4();
        let scope = Scope::Room(name.to_string());

        let mut graph = Graph::new(scope.clone(), sink.clone());
        let link_client = graph.add_client(name, Some(uuid), false);
        let studio_client = studio.add_client(name, Some(uuid), false);

        sink.publish(Notification::RoomAppeared {
            name: name.to_string(),
            uuid,
        });
        info!(room = name, %uuid, "room created");

        Self {
            name: name.to_string(),
            uuid,
            graph,
            supervisor: AppSupervisor::new(name, scope, host),
            project: ProjectInfo::default(),
            link_client,
            studio_client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn scope(&self) -> Scope {
        Scope::Room(self.name.clone())
    }

    pub fn link_client(&self) -> ClientId {
        self.link_client
    }

    pub fn studio_client(&self) -> ClientId {
        self.studio_client
    }

    pub fn is_attached(&self, studio: &Graph) -> bool {
        studio.client(self.studio_client).is_some_and(|c| !c.hidden)
    }

    pub fn attach(&self, studio: &mut Graph) -> Result<(), GraphError> {
        info!(room = %self.name, "attach");
        studio.show_client(self.studio_client)
    }

    pub fn detach(&self, studio: &mut Graph) -> Result<(), GraphError> {
        info!(room = %self.name, "detach");
        studio.hide_client(self.studio_client)
    }

    /// Add a boundary port. `is_input` is the room-side direction; the
    /// studio side is its opposite.
    pub fn add_link_port(
        &mut self,
        studio: &mut Graph,
        name: &str,
        port_type: PortType,
        is_input: bool,
    ) -> Result<(PortId, PortId), GraphError> {
        let (inner_flags, outer_flags) = if is_input {
            (PortFlags::input(), PortFlags::output())
        } else {
            (PortFlags::output(), PortFlags::input())
        };

        let inner = self
            .graph
            .add_port(self.link_client, NewPort::new(name, port_type, inner_flags))?;
        let inner_uuid = self
            .graph
            .port(inner)
            .map(|p| p.uuid)
            .ok_or(GraphError::PortNotFound(inner))?;

        let hidden = !self.is_attached(studio);
        let outer = studio.add_port(
            self.studio_client,
            NewPort::new(name, port_type, outer_flags).hidden(hidden),
        )?;
        studio.set_link_override(outer, Some(inner_uuid))?;
        Ok((inner, outer))
    }

    /// Room-side link ports in creation order.
    pub fn link_ports(&self) -> Vec<&Port> {
        self.graph.client_ports(self.link_client)
    }

    /// Tear down: the studio client goes away with its ports.
    pub fn destroy(mut self, studio: &mut Graph, sink: &SharedSink) -> Result<(), GraphError> {
        self.supervisor.clear();
        self.graph.clear();
        studio.remove_client(self.studio_client)?;
        sink.publish(Notification::RoomDisappeared { name: self.name.clone() });
        info!(room = %self.name, "room destroyed");
        Ok(())
    }
}
