//! Mirrors the live audio server into the studio graph.
//!
//! The server's `system` client is split in two pseudo-clients with fixed
//! identities, one for capture (server outputs) and one for playback (server
//! inputs). Every other client maps one to one. When the graph is
//! persistent, vanished live objects are hidden instead of removed so their
//! connections come back with them.

use std::collections::{HashMap, HashSet};

use greenproto::{PortFlags, PortType};
use tracing::{debug, info, warn};
use uuid::{uuid, Uuid};

use crate::graph::{ClientId, Graph, GraphError, NewPort, PortId};
use crate::server::{LivePort, ServerEvent};

pub const SYSTEM_CLIENT_NAME: &str = "system";
pub const HARDWARE_CAPTURE_NAME: &str = "Hardware Capture";
pub const HARDWARE_PLAYBACK_NAME: &str = "Hardware Playback";
pub const HARDWARE_CAPTURE_UUID: Uuid = uuid!("47c1cd18-7b21-4389-bec4-6e0658e1d6b1");
pub const HARDWARE_PLAYBACK_UUID: Uuid = uuid!("b2a0bb06-28d8-4bfe-956e-eb24378f9629");

#[derive(Debug, Clone)]
struct LiveClient {
    name: String,
    pid: i32,
}

#[derive(Debug, Default)]
pub struct GraphProjector {
    system_client: Option<u64>,
    capture: Option<ClientId>,
    playback: Option<ClientId>,
    clients: HashMap<u64, LiveClient>,
    /// live port id -> `client:port`
    port_names: HashMap<u64, String>,
    /// Graph clients created for live clients. Only these are reused when a
    /// client of the same name returns.
    projected: HashSet<ClientId>,
}

impl GraphProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process id the server reported for a live client.
    pub fn client_pid(&self, live_id: u64) -> Option<i32> {
        self.clients.get(&live_id).map(|c| c.pid).filter(|pid| *pid > 0)
    }

    /// Address of a graph port on the live server.
    pub fn live_port(&self, graph: &Graph, port: PortId) -> Option<LivePort> {
        let id = graph.port(port)?.live_id?;
        let full_name = self.port_names.get(&id)?.clone();
        Some(LivePort { id, full_name })
    }

    /// Apply one feed event to `graph`.
    pub fn apply(&mut self, graph: &mut Graph, event: &ServerEvent) -> Result<(), GraphError> {
        match event {
            ServerEvent::Started => {
                info!("audio server started");
                Ok(())
            }
            ServerEvent::Stopped => {
                self.server_gone(graph);
                Ok(())
            }
            ServerEvent::Failed(reason) => {
                warn!("audio server request failed: {}", reason);
                Ok(())
            }
            ServerEvent::ClientAppeared { id, name, pid } => {
                self.client_appeared(graph, *id, name, *pid);
                Ok(())
            }
            ServerEvent::ClientDisappeared { id } => self.client_disappeared(graph, *id),
            ServerEvent::PortAppeared {
                client_id,
                port_id,
                name,
                is_input,
                is_terminal,
                is_midi,
            } => self.port_appeared(graph, *client_id, *port_id, name, *is_input, *is_terminal, *is_midi),
            ServerEvent::PortDisappeared { client_id, port_id } => {
                self.port_disappeared(graph, *client_id, *port_id)
            }
            ServerEvent::PortsConnected { port1_id, port2_id } => {
                self.ports_connected(graph, *port1_id, *port2_id)
            }
            ServerEvent::PortsDisconnected { port1_id, port2_id } => {
                self.ports_disconnected(graph, *port1_id, *port2_id)
            }
        }
    }

    fn client_appeared(&mut self, graph: &mut Graph, id: u64, name: &str, pid: i32) {
        debug!(live.id = id, client.name = name, pid, "client appeared");
        self.clients.insert(
            id,
            LiveClient {
                name: name.to_string(),
                pid,
            },
        );

        if name == SYSTEM_CLIENT_NAME {
            self.system_client = Some(id);
            return;
        }

        // a persistent graph may still hold this client from a previous run
        let existing = graph
            .clients()
            .find(|c| c.name == name && c.live_id.is_none() && self.projected.contains(&c.id))
            .map(|c| c.id)
            .filter(|_| graph.is_persist());
        let client = match existing {
            Some(client) => client,
            None => {
                let client = graph.add_client(name, None, true);
                self.projected.insert(client);
                client
            }
        };
        if let Err(e) = graph.set_client_live_id(client, Some(id)) {
            warn!(live.id = id, "cannot record live id: {}", e);
        }
    }

    fn client_disappeared(&mut self, graph: &mut Graph, id: u64) -> Result<(), GraphError> {
        debug!(live.id = id, "client disappeared");
        self.clients.remove(&id);

        if self.system_client == Some(id) {
            self.system_client = None;
            return Ok(());
        }

        let Some(client) = graph.find_client_by_live_id(id) else {
            return Ok(());
        };
        self.forget_client(graph, client)
    }

    fn forget_client(&mut self, graph: &mut Graph, client: ClientId) -> Result<(), GraphError> {
        let live_ports: Vec<u64> = graph
            .client_ports(client)
            .iter()
            .filter_map(|p| p.live_id)
            .collect();
        for live in live_ports {
            self.port_names.remove(&live);
        }

        if graph.is_persist() {
            graph.hide_client(client)?;
            graph.set_client_live_id(client, None)?;
            for port in graph.client(client).map(|c| c.port_ids().to_vec()).unwrap_or_default() {
                graph.set_port_live_id(port, None)?;
            }
            Ok(())
        } else {
            self.projected.remove(&client);
            graph.remove_client(client)
        }
    }

    /// Pseudo-client for one direction of the `system` client.
    fn hardware_client(&mut self, graph: &mut Graph, capture: bool) -> ClientId {
        let (slot, name, uuid) = if capture {
            (&mut self.capture, HARDWARE_CAPTURE_NAME, HARDWARE_CAPTURE_UUID)
        } else {
            (&mut self.playback, HARDWARE_PLAYBACK_NAME, HARDWARE_PLAYBACK_UUID)
        };
        if let Some(client) = slot.filter(|c| graph.client(*c).is_some()) {
            return client;
        }
        let client = graph
            .find_client_by_uuid(uuid)
            .unwrap_or_else(|| graph.add_client(name, Some(uuid), true));
        *slot = Some(client);
        client
    }

    #[allow(clippy::too_many_arguments)]
    fn port_appeared(
        &mut self,
        graph: &mut Graph,
        client_id: u64,
        port_id: u64,
        name: &str,
        is_input: bool,
        is_terminal: bool,
        is_midi: bool,
    ) -> Result<(), GraphError> {
        debug!(live.client = client_id, live.port = port_id, port.name = name, is_input, is_midi, "port appeared");

        let client = if self.system_client == Some(client_id) {
            self.hardware_client(graph, !is_input)
        } else if let Some(client) = graph.find_client_by_live_id(client_id) {
            client
        } else {
            warn!(live.client = client_id, port.name = name, "port of unknown client ignored");
            return Ok(());
        };

        if let Some(owner) = self.clients.get(&client_id) {
            self.port_names
                .insert(port_id, format!("{}:{}", owner.name, name));
        }

        let port_type = if is_midi { PortType::Midi } else { PortType::Audio };
        let direction = if is_input { PortFlags::input() } else { PortFlags::output() };
        let flags = direction.with_terminal(is_terminal);

        // reuse a remembered port so hidden connections on it come back
        let remembered = graph
            .find_port_by_name(client, name)
            .filter(|p| graph.port(*p).is_some_and(|p| p.live_id.is_none()));
        match remembered {
            Some(port) => {
                graph.set_port_live_id(port, Some(port_id))?;
                graph.adjust_port(port, port_type, flags)?;
                graph.show_port(port)
            }
            None => graph
                .add_port(client, NewPort::new(name, port_type, flags).with_live_id(port_id))
                .map(|_| ()),
        }
    }

    fn port_disappeared(&mut self, graph: &mut Graph, client_id: u64, port_id: u64) -> Result<(), GraphError> {
        debug!(live.client = client_id, live.port = port_id, "port disappeared");
        self.port_names.remove(&port_id);

        let Some(port) = graph.find_port_by_live_id(port_id) else {
            return Ok(());
        };
        if graph.is_persist() {
            graph.hide_port(port)?;
            graph.set_port_live_id(port, None)?;
            return Ok(());
        }

        let client = graph.remove_port(port)?;
        if self.is_hardware(client) && graph.client_is_empty(client) {
            graph.hide_client(client)?;
        }
        Ok(())
    }

    fn ports_connected(&mut self, graph: &mut Graph, port1: u64, port2: u64) -> Result<(), GraphError> {
        let (Some(a), Some(b)) = (graph.find_port_by_live_id(port1), graph.find_port_by_live_id(port2)) else {
            warn!(live.port1 = port1, live.port2 = port2, "connection between unknown ports ignored");
            return Ok(());
        };
        match graph.find_connection(a, b) {
            Some(id) => graph.show_connection(id),
            None => graph.add_connection(a, b, false).map(|_| ()),
        }
    }

    fn ports_disconnected(&mut self, graph: &mut Graph, port1: u64, port2: u64) -> Result<(), GraphError> {
        let (Some(a), Some(b)) = (graph.find_port_by_live_id(port1), graph.find_port_by_live_id(port2)) else {
            return Ok(());
        };
        match graph.find_connection(a, b) {
            Some(id) => graph.remove_connection(id, true),
            None => Ok(()),
        }
    }

    fn is_hardware(&self, client: ClientId) -> bool {
        self.capture == Some(client) || self.playback == Some(client)
    }

    /// The server went away: forget every live object but keep the
    /// pseudo-clients, hidden.
    fn server_gone(&mut self, graph: &mut Graph) {
        info!(graph = %graph.scope(), "audio server gone, retracting live objects");
        let live: Vec<ClientId> = graph
            .clients()
            .filter(|c| c.live_id.is_some())
            .map(|c| c.id)
            .collect();
        for client in live {
            if let Err(e) = self.forget_client(graph, client) {
                warn!("cannot retract client {}: {}", client, e);
            }
        }

        for client in [self.capture, self.playback].into_iter().flatten() {
            let ports: Vec<PortId> = graph.client(client).map(|c| c.port_ids().to_vec()).unwrap_or_default();
            for port in ports {
                let result = if graph.is_persist() {
                    graph.hide_port(port).and_then(|_| graph.set_port_live_id(port, None))
                } else {
                    graph.remove_port(port).map(|_| ())
                };
                if let Err(e) = result {
                    warn!("cannot retract hardware port {}: {}", port, e);
                }
            }
            if let Err(e) = graph.hide_client(client) {
                warn!("cannot hide hardware client {}: {}", client, e);
            }
        }

        self.system_client = None;
        self.clients.clear();
        self.port_names.clear();
    }

    /// Remove everything this projector put into the graph.
    pub fn shutdown(&mut self, graph: &mut Graph) {
        self.server_gone(graph);
        for client in [self.capture.take(), self.playback.take()].into_iter().flatten() {
            if let Err(e) = graph.remove_client(client) {
                debug!("hardware client already gone: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use greenproto::{Notification, Scope};
    use std::sync::Arc;

    fn setup(persist: bool) -> (GraphProjector, Graph, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let mut graph = Graph::new(Scope::Studio, sink.clone());
        if persist {
            graph.set_persist();
        }
        (GraphProjector::new(), graph, sink)
    }

    fn port(client_id: u64, port_id: u64, name: &str, is_input: bool) -> ServerEvent {
        ServerEvent::PortAppeared {
            client_id,
            port_id,
            name: name.into(),
            is_input,
            is_terminal: false,
            is_midi: false,
        }
    }

    fn client(id: u64, name: &str) -> ServerEvent {
        ServerEvent::ClientAppeared {
            id,
            name: name.into(),
            pid: 0,
        }
    }

    #[test]
    fn test_system_client_is_split() {
        let (mut p, mut g, _) = setup(false);
        p.apply(&mut g, &client(1, "system")).unwrap();
        p.apply(&mut g, &port(1, 10, "capture_1", false)).unwrap();
        p.apply(&mut g, &port(1, 11, "playback_1", true)).unwrap();

        let capture = g.find_client_by_uuid(HARDWARE_CAPTURE_UUID).unwrap();
        let playback = g.find_client_by_uuid(HARDWARE_PLAYBACK_UUID).unwrap();
        assert_eq!(g.client(capture).unwrap().name, "Hardware Capture");
        assert_eq!(g.client(playback).unwrap().name, "Hardware Playback");
        assert_eq!(g.client_ports(capture)[0].name, "capture_1");
        assert!(g.client_ports(playback)[0].flags.input);
        assert!(g.find_client_by_name("system", false).is_none());

        let live = p.live_port(&g, g.find_port_by_live_id(11).unwrap()).unwrap();
        assert_eq!(live.full_name, "system:playback_1");
    }

    #[test]
    fn test_client_shows_up_with_first_port() {
        let (mut p, mut g, sink) = setup(false);
        p.apply(&mut g, &client(2, "synth")).unwrap();
        assert!(sink.events().is_empty());

        p.apply(&mut g, &port(2, 20, "out", false)).unwrap();
        let events = sink.events();
        assert!(matches!(events[0], Notification::ClientAppeared { ref name, .. } if name == "synth"));
        assert!(matches!(events[1], Notification::PortAppeared { .. }));
    }

    #[test]
    fn test_midi_and_terminal_flags() {
        let (mut p, mut g, _) = setup(false);
        p.apply(&mut g, &client(2, "keys")).unwrap();
        p.apply(
            &mut g,
            &ServerEvent::PortAppeared {
                client_id: 2,
                port_id: 21,
                name: "midi_out".into(),
                is_input: false,
                is_terminal: true,
                is_midi: true,
            },
        )
        .unwrap();
        let port = g.port(g.find_port_by_live_id(21).unwrap()).unwrap();
        assert_eq!(port.port_type, PortType::Midi);
        assert!(port.flags.output && port.flags.terminal);
    }

    #[test]
    fn test_connections_mirror_by_live_id() {
        let (mut p, mut g, _) = setup(false);
        p.apply(&mut g, &client(2, "a")).unwrap();
        p.apply(&mut g, &client(3, "b")).unwrap();
        p.apply(&mut g, &port(2, 20, "out", false)).unwrap();
        p.apply(&mut g, &port(3, 30, "in", true)).unwrap();

        p.apply(&mut g, &ServerEvent::PortsConnected { port1_id: 20, port2_id: 30 }).unwrap();
        let (a, b) = (g.find_port_by_live_id(20).unwrap(), g.find_port_by_live_id(30).unwrap());
        assert!(g.find_connection(a, b).is_some());

        p.apply(&mut g, &ServerEvent::PortsDisconnected { port1_id: 20, port2_id: 30 }).unwrap();
        assert!(g.find_connection(a, b).is_none());
    }

    #[test]
    fn test_transient_graph_drops_vanished_client() {
        let (mut p, mut g, _) = setup(false);
        p.apply(&mut g, &client(2, "a")).unwrap();
        p.apply(&mut g, &port(2, 20, "out", false)).unwrap();
        p.apply(&mut g, &ServerEvent::ClientDisappeared { id: 2 }).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn test_persistent_graph_restores_connection_on_return() {
        let (mut p, mut g, sink) = setup(true);
        p.apply(&mut g, &client(2, "a")).unwrap();
        p.apply(&mut g, &client(3, "b")).unwrap();
        p.apply(&mut g, &port(2, 20, "out", false)).unwrap();
        p.apply(&mut g, &port(3, 30, "in", true)).unwrap();
        p.apply(&mut g, &ServerEvent::PortsConnected { port1_id: 20, port2_id: 30 }).unwrap();

        p.apply(&mut g, &ServerEvent::Stopped).unwrap();
        assert!(g.looks_empty());
        assert!(!g.is_empty());
        assert!(!g.has_visible_connections());

        // server restarted with new live ids
        sink.take();
        p.apply(&mut g, &client(7, "a")).unwrap();
        p.apply(&mut g, &client(8, "b")).unwrap();
        p.apply(&mut g, &port(7, 70, "out", false)).unwrap();
        p.apply(&mut g, &port(8, 80, "in", true)).unwrap();

        assert!(g.has_visible_connections());
        assert_eq!(g.clients().count(), 2);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Notification::PortsConnected { .. })));
    }

    #[test]
    fn test_live_client_never_takes_over_virtual_namesake() {
        let (mut p, mut g, _) = setup(true);
        let room = g.add_client("drums", Some(Uuid::new_v4()), false);
        let link = g
            .add_port(room, NewPort::new("kick", PortType::Audio, PortFlags::output()))
            .unwrap();

        p.apply(&mut g, &client(5, "drums")).unwrap();
        p.apply(&mut g, &port(5, 50, "out", false)).unwrap();
        let live = g.find_client_by_live_id(5).unwrap();
        assert_ne!(live, room);
        assert!(g.client(room).unwrap().live_id.is_none());
        assert_eq!(g.client_ports(room).len(), 1);

        p.apply(&mut g, &ServerEvent::ClientDisappeared { id: 5 }).unwrap();
        assert!(g.client(live).unwrap().hidden);
        assert!(!g.client(room).unwrap().hidden);
        assert!(!g.port(link).unwrap().hidden);

        // the projected client is the one brought back
        p.apply(&mut g, &client(6, "drums")).unwrap();
        assert_eq!(g.find_client_by_live_id(6), Some(live));
    }

    #[test]
    fn test_live_client_named_like_hardware_gets_its_own_client() {
        let (mut p, mut g, _) = setup(true);
        p.apply(&mut g, &client(1, "system")).unwrap();
        p.apply(&mut g, &port(1, 10, "capture_1", false)).unwrap();
        let capture = g.find_client_by_uuid(HARDWARE_CAPTURE_UUID).unwrap();

        p.apply(&mut g, &client(2, HARDWARE_CAPTURE_NAME)).unwrap();
        assert_ne!(g.find_client_by_live_id(2), Some(capture));
    }

    #[test]
    fn test_shutdown_removes_pseudo_clients() {
        let (mut p, mut g, _) = setup(false);
        p.apply(&mut g, &client(1, "system")).unwrap();
        p.apply(&mut g, &port(1, 10, "capture_1", false)).unwrap();
        p.apply(&mut g, &ServerEvent::Stopped).unwrap();
        // kept (hidden) across a server stop
        assert!(g.find_client_by_uuid(HARDWARE_CAPTURE_UUID).is_some());

        p.shutdown(&mut g);
        assert!(g.is_empty());
    }

    #[test]
    fn test_client_pid_is_remembered() {
        let (mut p, mut g, _) = setup(false);
        p.apply(
            &mut g,
            &ServerEvent::ClientAppeared {
                id: 4,
                name: "zyn".into(),
                pid: 4321,
            },
        )
        .unwrap();
        assert_eq!(p.client_pid(4), Some(4321));
        p.apply(&mut g, &ServerEvent::ClientDisappeared { id: 4 }).unwrap();
        assert_eq!(p.client_pid(4), None);
    }
}
