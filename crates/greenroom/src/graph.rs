//! Routing graph
//!
//! Clients own ordered ports; connections join two ports. Ports live as nodes
//! of a petgraph `StableGraph` and connections as its edges, so removing a
//! port drops every connection on it and indices of other entities stay put.
//!
//! Every entity carries a hidden flag. Hidden entities are remembered but
//! never reported to peers; a hidden connection is a connection intent that
//! is realized as soon as both of its ports become visible again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::ControlFlow;

use greenproto::{
    ClientSnapshot, ConnectionSnapshot, GraphSnapshot, Notification, PortFlags, PortSnapshot,
    PortType, Scope,
};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dict::Dict;
use crate::notify::SharedSink;
use crate::supervisor::AppRenamer;

macro_rules! graph_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

graph_id!(
    /// Graph-local client id, never reused.
    ClientId
);
graph_id!(
    /// Graph-local port id, never reused.
    PortId
);
graph_id!(
    /// Graph-local connection id, never reused.
    ConnectionId
);

/// Errors that can occur during graph operations
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    ClientNotFound(ClientId),
    PortNotFound(PortId),
    ConnectionNotFound(ConnectionId),
    AlreadyConnected { port1: PortId, port2: PortId },
    SelfConnection(PortId),
    NotVisible(ConnectionId),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::ClientNotFound(id) => write!(f, "client not found: {}", id),
            GraphError::PortNotFound(id) => write!(f, "port not found: {}", id),
            GraphError::ConnectionNotFound(id) => write!(f, "connection not found: {}", id),
            GraphError::AlreadyConnected { port1, port2 } => {
                write!(f, "ports {} and {} are already connected", port1, port2)
            }
            GraphError::SelfConnection(id) => write!(f, "cannot connect port {} to itself", id),
            GraphError::NotVisible(id) => {
                write!(f, "connection {} has a hidden endpoint", id)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// A client: a named group of ports, usually one audio-server client.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub hidden: bool,
    pub uuid: Uuid,
    /// Id the live audio server knows this client by.
    pub live_id: Option<u64>,
    /// Supervised app that owns this client.
    pub app_uuid: Option<Uuid>,
    ports: Vec<PortId>,
}

impl Client {
    /// Port ids in registration order.
    pub fn port_ids(&self) -> &[PortId] {
        &self.ports
    }
}

#[derive(Debug, Clone)]
pub struct Port {
    pub id: PortId,
    pub client: ClientId,
    pub name: String,
    pub port_type: PortType,
    pub flags: PortFlags,
    pub hidden: bool,
    pub uuid: Uuid,
    pub live_id: Option<u64>,
    /// Identity this port assumes when looked up across a room boundary.
    pub link_override: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct Connection {
    id: ConnectionId,
    hidden: bool,
    dict: Dict,
}

/// Borrowed view of a connection handed to iteration callbacks.
pub struct ConnectionView<'a> {
    pub id: ConnectionId,
    pub hidden: bool,
    pub port1: &'a Port,
    pub port2: &'a Port,
    pub dict: &'a Dict,
}

/// Parameters for [`Graph::add_port`].
#[derive(Debug, Clone)]
pub struct NewPort {
    pub name: String,
    pub port_type: PortType,
    pub flags: PortFlags,
    pub uuid: Option<Uuid>,
    pub live_id: Option<u64>,
    pub hidden: bool,
}

impl NewPort {
    pub fn new(name: impl Into<String>, port_type: PortType, flags: PortFlags) -> Self {
        Self {
            name: name.into(),
            port_type,
            flags,
            uuid: None,
            live_id: None,
            hidden: false,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_live_id(mut self, live_id: u64) -> Self {
        self.live_id = Some(live_id);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

/// Two-phase node walk: `client_begin`, its ports, `client_end`.
///
/// Hidden entities are visited too; check their `hidden` flag.
pub trait GraphVisitor {
    fn client_begin(&mut self, _client: &Client) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn port(&mut self, _client: &Client, _port: &Port) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn client_end(&mut self, _client: &Client) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// The routing graph of one scope.
pub struct Graph {
    scope: Scope,
    version: u64,
    persist: bool,
    dict: Dict,
    clients: Vec<Client>,
    inner: StableGraph<Port, Connection>,
    port_index: HashMap<PortId, NodeIndex>,
    connection_index: BTreeMap<ConnectionId, EdgeIndex>,
    next_client: u64,
    next_port: u64,
    next_connection: u64,
    sink: SharedSink,
}

impl Graph {
    pub fn new(scope: Scope, sink: SharedSink) -> Self {
        Self {
            scope,
            version: 0,
            persist: false,
            dict: Dict::new(),
            clients: Vec::new(),
            inner: StableGraph::new(),
            port_index: HashMap::new(),
            connection_index: BTreeMap::new(),
            next_client: 1,
            next_port: 1,
            next_connection: 1,
            sink,
        }
    }

    /// Structural copy under a new scope. Ids are preserved, the version
    /// starts over and nothing is announced.
    pub fn copy_as(&self, scope: Scope) -> Graph {
        Graph {
            scope,
            version: 0,
            persist: self.persist,
            dict: self.dict.clone(),
            clients: self.clients.clone(),
            inner: self.inner.clone(),
            port_index: self.port_index.clone(),
            connection_index: self.connection_index.clone(),
            next_client: self.next_client,
            next_port: self.next_port,
            next_connection: self.next_connection,
            sink: self.sink.clone(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_persist(&mut self) {
        self.persist = true;
    }

    /// Persistent graphs keep vanished live objects as hidden entries.
    pub fn is_persist(&self) -> bool {
        self.persist
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    pub fn dict_mut(&mut self) -> &mut Dict {
        &mut self.dict
    }

    fn emit(&mut self, build: impl FnOnce(Scope, u64) -> Notification) {
        self.version += 1;
        let notification = build(self.scope.clone(), self.version);
        self.sink.publish(notification);
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    pub fn add_client(&mut self, name: &str, uuid: Option<Uuid>, hidden: bool) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;

        let uuid = uuid.filter(|u| !u.is_nil()).unwrap_or_else(Uuid::new_v4);
        self.clients.push(Client {
            id,
            name: name.to_string(),
            hidden,
            uuid,
            live_id: None,
            app_uuid: None,
            ports: Vec::new(),
        });

        if !hidden {
            let name = name.to_string();
            self.emit(|scope, version| Notification::ClientAppeared {
                scope,
                version,
                client_id: id.0,
                name,
            });
        }
        debug!(graph = %self.scope, client.id = %id, client.name = name, hidden, "client added");
        id
    }

    /// Remove a client together with its ports and their connections.
    pub fn remove_client(&mut self, id: ClientId) -> Result<(), GraphError> {
        let ports = self.client_ref(id)?.ports.clone();
        for port in ports {
            self.remove_port(port)?;
        }

        let pos = self.client_pos(id)?;
        let client = self.clients.remove(pos);
        if !client.hidden {
            self.emit(|scope, version| Notification::ClientDisappeared {
                scope,
                version,
                client_id: id.0,
            });
        }
        debug!(graph = %self.scope, client.id = %id, client.name = %client.name, "client removed");
        Ok(())
    }

    pub fn rename_client(&mut self, id: ClientId, name: &str) -> Result<(), GraphError> {
        let pos = self.client_pos(id)?;
        let client = &mut self.clients[pos];
        if client.name == name {
            return Ok(());
        }
        let old_name = std::mem::replace(&mut client.name, name.to_string());
        if !client.hidden {
            let new_name = name.to_string();
            self.emit(|scope, version| Notification::ClientRenamed {
                scope,
                version,
                client_id: id.0,
                old_name,
                new_name,
            });
        }
        Ok(())
    }

    pub fn set_client_live_id(&mut self, id: ClientId, live_id: Option<u64>) -> Result<(), GraphError> {
        let pos = self.client_pos(id)?;
        self.clients[pos].live_id = live_id;
        Ok(())
    }

    pub fn set_client_app(&mut self, id: ClientId, app: Option<Uuid>) -> Result<(), GraphError> {
        let pos = self.client_pos(id)?;
        self.clients[pos].app_uuid = app;
        Ok(())
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Clients in registration order.
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    /// With `appless`, clients linked to a supervised app are skipped.
    pub fn find_client_by_name(&self, name: &str, appless: bool) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|c| c.name == name && (!appless || c.app_uuid.is_none()))
            .map(|c| c.id)
    }

    pub fn find_client_by_live_id(&self, live_id: u64) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|c| c.live_id == Some(live_id))
            .map(|c| c.id)
    }

    pub fn find_client_by_uuid(&self, uuid: Uuid) -> Option<ClientId> {
        self.clients.iter().find(|c| c.uuid == uuid).map(|c| c.id)
    }

    pub fn find_client_by_app(&self, app: Uuid) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|c| c.app_uuid == Some(app))
            .map(|c| c.id)
    }

    fn client_pos(&self, id: ClientId) -> Result<usize, GraphError> {
        self.clients
            .iter()
            .position(|c| c.id == id)
            .ok_or(GraphError::ClientNotFound(id))
    }

    fn client_ref(&self, id: ClientId) -> Result<&Client, GraphError> {
        self.client(id).ok_or(GraphError::ClientNotFound(id))
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Add a port at the end of `client`'s port list.
    ///
    /// A visible port added to a hidden client makes the client visible.
    pub fn add_port(&mut self, client: ClientId, new_port: NewPort) -> Result<PortId, GraphError> {
        let pos = self.client_pos(client)?;
        if !new_port.hidden && self.clients[pos].hidden {
            self.reveal_client(pos);
        }

        let id = PortId(self.next_port);
        self.next_port += 1;

        let port = Port {
            id,
            client,
            name: new_port.name,
            port_type: new_port.port_type,
            flags: new_port.flags,
            hidden: new_port.hidden,
            uuid: new_port.uuid.filter(|u| !u.is_nil()).unwrap_or_else(Uuid::new_v4),
            live_id: new_port.live_id,
            link_override: None,
        };
        let announce = (!port.hidden).then(|| (port.name.clone(), port.port_type, port.flags));

        let index = self.inner.add_node(port);
        self.port_index.insert(id, index);
        self.clients[pos].ports.push(id);

        if let Some((name, port_type, flags)) = announce {
            self.emit(|scope, version| Notification::PortAppeared {
                scope,
                version,
                client_id: client.0,
                port_id: id.0,
                name,
                port_type,
                flags,
            });
        }
        Ok(id)
    }

    /// Remove a port and every connection on it. Returns the owning client.
    pub fn remove_port(&mut self, id: PortId) -> Result<ClientId, GraphError> {
        let index = self.port_index(id)?;

        for edge in self.edges_of(index) {
            self.drop_edge(edge);
        }

        let port = self
            .inner
            .remove_node(index)
            .ok_or(GraphError::PortNotFound(id))?;
        self.port_index.remove(&id);
        if let Ok(pos) = self.client_pos(port.client) {
            self.clients[pos].ports.retain(|p| *p != id);
        }

        if !port.hidden {
            self.emit(|scope, version| Notification::PortDisappeared {
                scope,
                version,
                client_id: port.client.0,
                port_id: id.0,
            });
        }
        Ok(port.client)
    }

    pub fn remove_port_by_live_id(&mut self, live_id: u64) -> Option<ClientId> {
        let id = self.find_port_by_live_id(live_id)?;
        self.remove_port(id).ok()
    }

    /// Move a port to another client, keeping its connections.
    pub fn move_port(&mut self, id: PortId, to: ClientId) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        let to_pos = self.client_pos(to)?;
        let from = self.inner[index].client;
        if from == to {
            return Ok(());
        }

        let was_visible = !self.inner[index].hidden;
        if was_visible {
            self.hide_port(id)?;
        }

        if let Ok(from_pos) = self.client_pos(from) {
            self.clients[from_pos].ports.retain(|p| *p != id);
        }
        self.clients[to_pos].ports.push(id);
        self.inner[index].client = to;

        if was_visible {
            self.show_port(id)?;
        }
        Ok(())
    }

    pub fn rename_port(&mut self, id: PortId, name: &str) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        let port = &mut self.inner[index];
        if port.name == name {
            return Ok(());
        }
        let old_name = std::mem::replace(&mut port.name, name.to_string());
        if !port.hidden {
            let client = port.client;
            let new_name = name.to_string();
            self.emit(|scope, version| Notification::PortRenamed {
                scope,
                version,
                client_id: client.0,
                port_id: id.0,
                old_name,
                new_name,
            });
        }
        Ok(())
    }

    /// Change type and flags. Visible ports are re-announced.
    pub fn adjust_port(
        &mut self,
        id: PortId,
        port_type: PortType,
        flags: PortFlags,
    ) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        let port = &self.inner[index];
        if port.port_type == port_type && port.flags == flags {
            return Ok(());
        }

        let was_visible = !port.hidden;
        if was_visible {
            self.hide_port(id)?;
        }
        let port = &mut self.inner[index];
        port.port_type = port_type;
        port.flags = flags;
        if was_visible {
            self.show_port(id)?;
        }
        Ok(())
    }

    pub fn set_port_live_id(&mut self, id: PortId, live_id: Option<u64>) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        self.inner[index].live_id = live_id;
        Ok(())
    }

    pub fn set_link_override(&mut self, id: PortId, uuid: Option<Uuid>) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        self.inner[index].link_override = uuid;
        Ok(())
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.port_index.get(&id).map(|ix| &self.inner[*ix])
    }

    pub fn port_client(&self, id: PortId) -> Option<ClientId> {
        self.port(id).map(|p| p.client)
    }

    pub fn is_port_present(&self, id: PortId) -> bool {
        self.port_index.contains_key(&id)
    }

    /// Ports of `client` in registration order.
    pub fn client_ports(&self, client: ClientId) -> Vec<&Port> {
        self.client(client)
            .map(|c| c.ports.iter().filter_map(|p| self.port(*p)).collect())
            .unwrap_or_default()
    }

    pub fn find_port_by_name(&self, client: ClientId, name: &str) -> Option<PortId> {
        self.client_ports(client)
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
    }

    pub fn find_port_by_live_id(&self, live_id: u64) -> Option<PortId> {
        self.all_ports()
            .find(|p| p.live_id == Some(live_id))
            .map(|p| p.id)
    }

    /// With `use_link_override`, a port carrying an override UUID is matched
    /// by that instead of its own.
    pub fn find_port_by_uuid(&self, uuid: Uuid, use_link_override: bool) -> Option<PortId> {
        self.all_ports()
            .find(|p| {
                let identity = if use_link_override {
                    p.link_override.unwrap_or(p.uuid)
                } else {
                    p.uuid
                };
                identity == uuid
            })
            .map(|p| p.id)
    }

    pub fn find_client_port_by_uuid(&self, client: ClientId, uuid: Uuid) -> Option<PortId> {
        self.client_ports(client)
            .into_iter()
            .find(|p| p.uuid == uuid)
            .map(|p| p.id)
    }

    fn all_ports(&self) -> impl Iterator<Item = &Port> {
        self.inner.node_indices().map(move |ix| &self.inner[ix])
    }

    fn port_index(&self, id: PortId) -> Result<NodeIndex, GraphError> {
        self.port_index
            .get(&id)
            .copied()
            .ok_or(GraphError::PortNotFound(id))
    }

    fn edges_of(&self, index: NodeIndex) -> Vec<EdgeIndex> {
        self.inner
            .edges_directed(index, Direction::Outgoing)
            .chain(self.inner.edges_directed(index, Direction::Incoming))
            .map(|e| e.id())
            .collect()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Connect two registered ports.
    ///
    /// A connection asked to be visible while one of its ports is hidden is
    /// stored hidden and realized once both ports are shown.
    pub fn add_connection(
        &mut self,
        port1: PortId,
        port2: PortId,
        hidden: bool,
    ) -> Result<ConnectionId, GraphError> {
        if port1 == port2 {
            return Err(GraphError::SelfConnection(port1));
        }
        let a = self.port_index(port1)?;
        let b = self.port_index(port2)?;
        if self.find_connection(port1, port2).is_some() {
            return Err(GraphError::AlreadyConnected { port1, port2 });
        }

        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let hidden = hidden || self.inner[a].hidden || self.inner[b].hidden;
        let edge = self.inner.add_edge(
            a,
            b,
            Connection {
                id,
                hidden,
                dict: Dict::new(),
            },
        );
        self.connection_index.insert(id, edge);

        if !hidden {
            self.announce_connection(edge, true);
        }
        Ok(id)
    }

    /// Remove a connection.
    ///
    /// Without `force` a visible connection is only retracted to hidden, so
    /// the intent survives; `force` purges the record.
    pub fn remove_connection(&mut self, id: ConnectionId, force: bool) -> Result<(), GraphError> {
        let edge = self
            .connection_index
            .get(&id)
            .copied()
            .ok_or(GraphError::ConnectionNotFound(id))?;

        if force {
            self.drop_edge(edge);
        } else {
            self.retract_edge(edge);
        }
        Ok(())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionView<'_>> {
        let edge = *self.connection_index.get(&id)?;
        self.view(edge)
    }

    pub fn connection_ports(&self, id: ConnectionId) -> Option<(PortId, PortId)> {
        self.connection(id).map(|c| (c.port1.id, c.port2.id))
    }

    /// Order of the two ports does not matter.
    pub fn find_connection(&self, port1: PortId, port2: PortId) -> Option<ConnectionId> {
        let a = *self.port_index.get(&port1)?;
        let b = *self.port_index.get(&port2)?;
        self.inner
            .find_edge(a, b)
            .or_else(|| self.inner.find_edge(b, a))
            .map(|e| self.inner[e].id)
    }

    pub fn connection_dict_mut(&mut self, id: ConnectionId) -> Option<&mut Dict> {
        let edge = *self.connection_index.get(&id)?;
        self.inner.edge_weight_mut(edge).map(|c| &mut c.dict)
    }

    pub fn has_visible_connections(&self) -> bool {
        self.inner
            .edge_indices()
            .any(|e| !self.inner[e].hidden)
    }

    fn view(&self, edge: EdgeIndex) -> Option<ConnectionView<'_>> {
        let (a, b) = self.inner.edge_endpoints(edge)?;
        let conn = self.inner.edge_weight(edge)?;
        Some(ConnectionView {
            id: conn.id,
            hidden: conn.hidden,
            port1: &self.inner[a],
            port2: &self.inner[b],
            dict: &conn.dict,
        })
    }

    fn announce_connection(&mut self, edge: EdgeIndex, connected: bool) {
        let Some(view) = self.view(edge) else {
            return;
        };
        let (id, c1, p1, c2, p2) = (
            view.id.0,
            view.port1.client.0,
            view.port1.id.0,
            view.port2.client.0,
            view.port2.id.0,
        );
        self.emit(|scope, version| {
            if connected {
                Notification::PortsConnected {
                    scope,
                    version,
                    client1_id: c1,
                    port1_id: p1,
                    client2_id: c2,
                    port2_id: p2,
                    connection_id: id,
                }
            } else {
                Notification::PortsDisconnected {
                    scope,
                    version,
                    client1_id: c1,
                    port1_id: p1,
                    client2_id: c2,
                    port2_id: p2,
                    connection_id: id,
                }
            }
        });
    }

    /// Visible connection becomes hidden; peers see a disconnect.
    fn retract_edge(&mut self, edge: EdgeIndex) {
        let hidden = match self.inner.edge_weight(edge) {
            Some(c) => c.hidden,
            None => return,
        };
        if hidden {
            return;
        }
        self.announce_connection(edge, false);
        if let Some(conn) = self.inner.edge_weight_mut(edge) {
            conn.hidden = true;
        }
    }

    fn drop_edge(&mut self, edge: EdgeIndex) {
        self.retract_edge(edge);
        if let Some(conn) = self.inner.remove_edge(edge) {
            self.connection_index.remove(&conn.id);
        }
    }

    /// Hidden connections on `index` whose ports are both visible come back.
    fn realize_connections_on(&mut self, index: NodeIndex) {
        for edge in self.edges_of(index) {
            self.try_realize(edge);
        }
    }

    fn try_realize(&mut self, edge: EdgeIndex) -> bool {
        let Some((a, b)) = self.inner.edge_endpoints(edge) else {
            return false;
        };
        let ready = self.inner[edge].hidden && !self.inner[a].hidden && !self.inner[b].hidden;
        if ready {
            self.inner[edge].hidden = false;
            self.announce_connection(edge, true);
        }
        ready
    }

    // ------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------

    fn reveal_client(&mut self, pos: usize) {
        let client = &mut self.clients[pos];
        if !client.hidden {
            return;
        }
        client.hidden = false;
        let (id, name) = (client.id, client.name.clone());
        self.emit(|scope, version| Notification::ClientAppeared {
            scope,
            version,
            client_id: id.0,
            name,
        });
    }

    /// Show a client and all of its ports.
    pub fn show_client(&mut self, id: ClientId) -> Result<(), GraphError> {
        let pos = self.client_pos(id)?;
        self.reveal_client(pos);
        for port in self.clients[pos].ports.clone() {
            self.show_port(port)?;
        }
        Ok(())
    }

    /// Hide a client and all of its ports; their connections turn hidden.
    pub fn hide_client(&mut self, id: ClientId) -> Result<(), GraphError> {
        let pos = self.client_pos(id)?;
        for port in self.clients[pos].ports.clone() {
            self.hide_port(port)?;
        }
        let client = &mut self.clients[pos];
        if client.hidden {
            return Ok(());
        }
        client.hidden = true;
        self.emit(|scope, version| Notification::ClientDisappeared {
            scope,
            version,
            client_id: id.0,
        });
        Ok(())
    }

    /// Show a port (and its client), then realize pending connections on it.
    pub fn show_port(&mut self, id: PortId) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        let client = self.inner[index].client;
        let pos = self.client_pos(client)?;
        self.reveal_client(pos);

        let port = &mut self.inner[index];
        if port.hidden {
            port.hidden = false;
            let (name, port_type, flags) = (port.name.clone(), port.port_type, port.flags);
            self.emit(|scope, version| Notification::PortAppeared {
                scope,
                version,
                client_id: client.0,
                port_id: id.0,
                name,
                port_type,
                flags,
            });
        }
        self.realize_connections_on(index);
        Ok(())
    }

    pub fn hide_port(&mut self, id: PortId) -> Result<(), GraphError> {
        let index = self.port_index(id)?;
        for edge in self.edges_of(index) {
            self.retract_edge(edge);
        }

        let port = &mut self.inner[index];
        if port.hidden {
            return Ok(());
        }
        port.hidden = true;
        let client = port.client;
        self.emit(|scope, version| Notification::PortDisappeared {
            scope,
            version,
            client_id: client.0,
            port_id: id.0,
        });
        Ok(())
    }

    pub fn show_connection(&mut self, id: ConnectionId) -> Result<(), GraphError> {
        let edge = self
            .connection_index
            .get(&id)
            .copied()
            .ok_or(GraphError::ConnectionNotFound(id))?;
        if !self.inner[edge].hidden || self.try_realize(edge) {
            Ok(())
        } else {
            Err(GraphError::NotVisible(id))
        }
    }

    /// Realize every hidden connection whose ports are visible.
    /// Returns how many came back.
    pub fn try_connect_hidden_connections(&mut self) -> usize {
        let edges: Vec<EdgeIndex> = self.connection_index.values().copied().collect();
        edges.into_iter().filter(|e| self.try_realize(*e)).count()
    }

    /// Retract every visible connection to hidden.
    pub fn disconnect_visible_connections(&mut self) {
        let edges: Vec<EdgeIndex> = self.connection_index.values().copied().collect();
        for edge in edges {
            self.retract_edge(edge);
        }
    }

    /// Hide everything that mirrors a live audio-server object and forget
    /// the live ids. Virtual entities (no live id) are left alone.
    pub fn hide_non_virtual(&mut self) {
        let ports: Vec<PortId> = self
            .all_ports()
            .filter(|p| p.live_id.is_some())
            .map(|p| p.id)
            .collect();
        for port in ports {
            if let Err(e) = self.hide_port(port) {
                warn!(graph = %self.scope, %port, "cannot hide live port: {}", e);
            }
            if let Some(index) = self.port_index.get(&port).copied() {
                self.inner[index].live_id = None;
            }
        }

        let clients: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| c.live_id.is_some())
            .map(|c| c.id)
            .collect();
        for client in clients {
            if self.client_looks_empty(client) {
                if let Err(e) = self.hide_client(client) {
                    warn!(graph = %self.scope, %client, "cannot hide live client: {}", e);
                }
            }
            if let Err(e) = self.set_client_live_id(client, None) {
                warn!(graph = %self.scope, %client, "cannot forget live id: {}", e);
            }
        }
    }

    /// Drop hidden connections, hidden ports and hidden clients.
    pub fn remove_hidden_objects(&mut self) {
        let edges: Vec<EdgeIndex> = self
            .connection_index
            .values()
            .copied()
            .filter(|e| self.inner[*e].hidden)
            .collect();
        for edge in edges {
            self.drop_edge(edge);
        }

        let ports: Vec<PortId> = self
            .all_ports()
            .filter(|p| p.hidden)
            .map(|p| p.id)
            .collect();
        for port in ports {
            if let Err(e) = self.remove_port(port) {
                warn!(graph = %self.scope, %port, "cannot remove hidden port: {}", e);
            }
        }

        let clients: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| c.hidden)
            .map(|c| c.id)
            .collect();
        for client in clients {
            if let Err(e) = self.remove_client(client) {
                warn!(graph = %self.scope, %client, "cannot remove hidden client: {}", e);
            }
        }
    }

    /// Remove every client, port and connection.
    pub fn clear(&mut self) {
        let clients: Vec<ClientId> = self.clients.iter().map(|c| c.id).collect();
        for client in clients {
            if let Err(e) = self.remove_client(client) {
                warn!(graph = %self.scope, %client, "cannot remove client: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Emptiness
    // ------------------------------------------------------------------

    /// No ports at all, hidden or not. Port-less clients do not count.
    pub fn is_empty(&self) -> bool {
        self.port_index.is_empty()
    }

    /// Nothing a peer could see: no visible client has a visible port.
    pub fn looks_empty(&self) -> bool {
        self.clients
            .iter()
            .all(|c| c.hidden || !self.client_has_visible_ports(c.id))
    }

    pub fn client_is_empty(&self, id: ClientId) -> bool {
        self.client(id).map(|c| c.ports.is_empty()).unwrap_or(true)
    }

    pub fn client_looks_empty(&self, id: ClientId) -> bool {
        !self.client_has_visible_ports(id)
    }

    pub fn client_has_visible_ports(&self, id: ClientId) -> bool {
        self.client_ports(id).iter().any(|p| !p.hidden)
    }

    pub fn client_has_visible_app_port(&self, id: ClientId, app: Uuid) -> bool {
        self.client(id).and_then(|c| c.app_uuid) == Some(app) && self.client_has_visible_ports(id)
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Walk clients in registration order, each followed by its ports.
    pub fn iterate_nodes(&self, visitor: &mut impl GraphVisitor) -> ControlFlow<()> {
        for client in &self.clients {
            visitor.client_begin(client)?;
            for port in client.ports.iter().filter_map(|p| self.port(*p)) {
                visitor.port(client, port)?;
            }
            visitor.client_end(client)?;
        }
        ControlFlow::Continue(())
    }

    /// Walk connections in creation order.
    pub fn iterate_connections(
        &self,
        mut f: impl FnMut(&ConnectionView<'_>) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        for edge in self.connection_index.values() {
            if let Some(view) = self.view(*edge) {
                f(&view)?;
            }
        }
        ControlFlow::Continue(())
    }

    /// Visible subset for peers.
    pub fn snapshot(&self) -> GraphSnapshot {
        let clients = self
            .clients
            .iter()
            .filter(|c| !c.hidden)
            .map(|c| ClientSnapshot {
                id: c.id.0,
                name: c.name.clone(),
                ports: self
                    .client_ports(c.id)
                    .into_iter()
                    .filter(|p| !p.hidden)
                    .map(|p| PortSnapshot {
                        id: p.id.0,
                        name: p.name.clone(),
                        port_type: p.port_type,
                        flags: p.flags,
                    })
                    .collect(),
            })
            .collect();

        let mut connections = Vec::new();
        let _ = self.iterate_connections(|c| {
            if !c.hidden {
                connections.push(ConnectionSnapshot {
                    id: c.id.0,
                    client1_id: c.port1.client.0,
                    port1_id: c.port1.id.0,
                    client2_id: c.port2.client.0,
                    port2_id: c.port2.id.0,
                });
            }
            ControlFlow::Continue(())
        });

        GraphSnapshot {
            version: self.version,
            clients,
            connections,
            dict: self.dict.to_map(),
        }
    }

    pub fn dump(&self) {
        debug!(graph = %self.scope, version = self.version, persist = self.persist, "graph dump");
        for client in &self.clients {
            debug!(
                "  client {} '{}' hidden={} uuid={} live={:?} app={:?}",
                client.id, client.name, client.hidden, client.uuid, client.live_id, client.app_uuid
            );
            for port in self.client_ports(client.id) {
                debug!(
                    "    port {} '{}' {} {:?} hidden={} live={:?} override={:?}",
                    port.id, port.name, port.port_type, port.flags, port.hidden, port.live_id,
                    port.link_override
                );
            }
        }
        let _ = self.iterate_connections(|c| {
            debug!(
                "  connection {} {} -> {} hidden={}",
                c.id, c.port1.id, c.port2.id, c.hidden
            );
            ControlFlow::Continue(())
        });
    }
}

impl AppRenamer for Graph {
    fn app_renamed(&mut self, app: Uuid, _old_name: &str, new_name: &str) {
        if let Some(client) = self.find_client_by_app(app) {
            if let Err(e) = self.rename_client(client, new_name) {
                warn!(graph = %self.scope, "rename of app client failed: {}", e);
            }
        }
    }
}
