//! Connections: one control channel per remote process
//!
//! A connection owns its transport and control-channel state. Split-screen
//! child connections share the parent's transport but keep independent
//! logical state; their outgoing traffic is routed through the parent.

use crate::entity::{EntityId, EntityRef, EntityWeak};
use crate::guid::Guid;
use crate::net::message::ControlMessage;
use crate::net::package_map::{PackageInfo, PackageMap};
use crate::net::transport::Transport;
use crate::net::{NetError, NetResult};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::rc::Rc;

/// Server-side control state for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    AwaitingHello,
    AwaitingLogin,
    /// PreLogin paused the login; welcome is deferred until resume
    PreLoginPending,
    Welcomed,
    InGame,
    Closed,
}

/// Client-side login progression against a server connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPhase {
    AwaitingChallenge,
    AwaitingWelcome,
    /// Welcome received; loading the named level before joining
    LoadingWorld { level_name: String },
    Joined,
}

/// Per-connection traffic counters
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// A channel replicating one entity to this connection
#[derive(Debug, Clone)]
pub struct ActorChannel {
    pub entity: Option<EntityWeak>,
    pub broken: bool,
}

/// A bidirectional control channel to one remote process
pub struct Connection {
    /// None for child connections, which share the parent's transport
    pub transport: Option<Box<dyn Transport>>,
    pub state: ControlState,
    pub client_phase: ClientPhase,
    pub negotiated_version: u32,
    pub supports_auth: bool,
    pub challenge: String,
    pub player_id: u64,
    pub request_url: String,
    pub client_response: String,
    pub package_map: PackageMap,
    /// Announced packages awaiting in-order verification
    pub pending_packages: VecDeque<PackageInfo>,
    /// Removals deferred until the client answers Have or Abort
    pub pending_remove_package_guids: Vec<Guid>,
    pub current_net_speed: i32,
    pub welcomed: bool,
    /// Login finished while paused; welcome fires on resume
    pub welcome_ready: bool,
    pub login_paused: bool,
    pub controller: Option<EntityRef>,
    pub children: Vec<Connection>,
    pub actor_channels: FxHashMap<EntityId, ActorChannel>,
    /// Peer bookkeeping: this peer reported losing the server
    pub lost_connection_to_host: bool,
    /// Reassembly buffer for chunked auth blobs
    pub auth_blob_buffer: String,
    /// Name of the world package the client has loaded
    pub client_world_package: String,
    /// Bytes queued against the netspeed throttle
    pub queued_bytes: usize,
    pub stats: ConnectionStats,
    /// Connection loss was already surfaced to the user
    pub loss_reported: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport: Some(transport),
            state: ControlState::AwaitingHello,
            client_phase: ClientPhase::AwaitingChallenge,
            negotiated_version: 0,
            supports_auth: false,
            challenge: String::new(),
            player_id: 0,
            request_url: String::new(),
            client_response: String::new(),
            package_map: PackageMap::default(),
            pending_packages: VecDeque::new(),
            pending_remove_package_guids: Vec::new(),
            current_net_speed: 0,
            welcomed: false,
            welcome_ready: false,
            login_paused: false,
            controller: None,
            children: Vec::new(),
            actor_channels: FxHashMap::default(),
            lost_connection_to_host: false,
            auth_blob_buffer: String::new(),
            client_world_package: String::new(),
            queued_bytes: 0,
            stats: ConnectionStats::default(),
            loss_reported: false,
        }
    }

    /// Logical child connection for an additional split-screen player
    pub fn new_child() -> Self {
        let mut child = Connection::new_detached();
        child.state = ControlState::AwaitingLogin;
        child
    }

    fn new_detached() -> Self {
        let mut connection = Connection::new(Box::new(NullTransport));
        connection.transport = None;
        connection
    }

    /// Encode and queue one message. Child connections route through
    /// their parent instead.
    pub fn send(&mut self, message: &ControlMessage) -> NetResult<()> {
        let frame = message.encode()?;
        match self.transport.as_mut() {
            Some(transport) => {
                debug!("send {} to {}", message.name(), transport.remote_addr());
                transport.send(&frame)?;
                self.queued_bytes += frame.len();
                self.stats.messages_sent += 1;
                Ok(())
            }
            None => Err(NetError::TransportClosed),
        }
    }

    /// Push queued traffic to the remote end
    pub fn flush_net(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.flush();
        }
    }

    /// Drain and decode every received control message
    pub fn drain_messages(&mut self) -> Vec<ControlMessage> {
        let frames = match self.transport.as_mut() {
            Some(transport) => transport.receive(),
            None => Vec::new(),
        };
        let mut messages = Vec::new();
        for frame in frames {
            match ControlMessage::decode(&frame) {
                Ok(message) => {
                    self.stats.messages_received += 1;
                    messages.push(message);
                }
                Err(e) => warn!("dropping undecodable control frame: {}", e),
            }
        }
        messages
    }

    pub fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        self.state = ControlState::Closed;
    }

    pub fn is_open(&self) -> bool {
        match (&self.transport, self.state) {
            (_, ControlState::Closed) => false,
            (Some(transport), _) => transport.is_open(),
            (None, _) => true,
        }
    }

    pub fn remote_addr(&self) -> String {
        self.transport
            .as_ref()
            .map(|t| t.remote_addr())
            .unwrap_or_else(|| "<child>".to_string())
    }

    /// Record an open channel for an entity replicated to this connection
    pub fn open_actor_channel(&mut self, id: EntityId, entity: &EntityRef) {
        self.actor_channels.insert(
            id,
            ActorChannel {
                entity: Some(Rc::downgrade(entity)),
                broken: false,
            },
        );
    }

    /// Server side: the channel is destroyed outright
    pub fn destroy_actor_channel(&mut self, id: EntityId) {
        self.actor_channels.remove(&id);
    }

    /// Client side: the channel cannot die until the server says so; the
    /// actor reference is nulled and the channel marked broken.
    pub fn break_actor_channel(&mut self, id: EntityId) {
        if let Some(channel) = self.actor_channels.get_mut(&id) {
            channel.entity = None;
            channel.broken = true;
        }
    }
}

/// Placeholder transport for constructing detached child connections
struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, _frame: &[u8]) -> NetResult<()> {
        Err(NetError::TransportClosed)
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn flush(&mut self) {}

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }

    fn remote_addr(&self) -> String {
        "<null>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::MemoryTransport;

    #[test]
    fn test_send_and_drain_roundtrip() {
        let (a, b) = MemoryTransport::pair("server", "client");
        let mut client = Connection::new(Box::new(a));
        let mut server = Connection::new(Box::new(b));

        client
            .send(&ControlMessage::Hello {
                min_version: 17,
                current_version: 19,
                supports_auth: false,
            })
            .expect("send failed");
        client.flush_net();

        let messages = server.drain_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name(), "Hello");
        assert_eq!(server.stats.messages_received, 1);
    }

    #[test]
    fn test_child_connection_has_no_transport() {
        let mut child = Connection::new_child();
        assert!(child.transport.is_none());
        assert!(child.send(&ControlMessage::Join).is_err());
        assert_eq!(child.state, ControlState::AwaitingLogin);
    }

    #[test]
    fn test_break_actor_channel_keeps_entry() {
        let (a, _b) = MemoryTransport::pair("server", "client");
        let mut connection = Connection::new(Box::new(a));
        let entity = std::rc::Rc::new(std::cell::RefCell::new(crate::entity::Entity::new(
            EntityId(9),
            "Door_9",
            crate::entity::EntityClass::new("Game.Door"),
        )));
        connection.open_actor_channel(EntityId(9), &entity);

        connection.break_actor_channel(EntityId(9));
        let channel = connection.actor_channels.get(&EntityId(9)).expect("channel gone");
        assert!(channel.broken);
        assert!(channel.entity.is_none());

        connection.destroy_actor_channel(EntityId(9));
        assert!(connection.actor_channels.is_empty());
    }
}
