use super::{ConnectionId, Room};
use crate::protocol::{RoomId, ServerMessage, UserId};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Outbound queue of one connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// A live transport connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbox: Outbox,
    /// Set once the connection has joined a room
    pub binding: Option<(RoomId, UserId)>,
}

/// Every room and connection known to the coordinator
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    connections: HashMap<ConnectionId, Connection>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn insert_room(&mut self, room: Room) -> &mut Room {
        let id = room.id.clone();
        self.rooms.entry(id).or_insert(room)
    }

    pub fn remove_room(&mut self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn add_connection(&mut self, id: ConnectionId, outbox: Outbox) {
        self.connections.insert(
            id,
            Connection {
                id,
                outbox,
                binding: None,
            },
        );
    }

    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Room and user a connection has joined as
    pub fn binding(&self, id: &ConnectionId) -> Option<(RoomId, UserId)> {
        self.connections.get(id).and_then(|c| c.binding.clone())
    }

    pub fn bind(&mut self, id: &ConnectionId, room_id: RoomId, user_id: UserId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.binding = Some((room_id, user_id));
        }
    }

    pub fn unbind(&mut self, id: &ConnectionId) -> Option<(RoomId, UserId)> {
        self.connections.get_mut(id).and_then(|c| c.binding.take())
    }

    /// Queue a message for one connection
    pub fn send(&self, id: &ConnectionId, message: ServerMessage) {
        match self.connections.get(id) {
            Some(conn) => {
                if conn.outbox.send(message).is_err() {
                    tracing::trace!(conn_id = %id, "Outbox closed");
                }
            }
            None => tracing::trace!(conn_id = %id, "Dropping message for unknown connection"),
        }
    }

    /// Send to every online member of a room
    pub fn broadcast(&self, room_id: &str, message: &ServerMessage) {
        self.broadcast_except(room_id, None, message);
    }

    /// Send to every online member of a room except `skip_user`
    pub fn broadcast_except(&self, room_id: &str, skip_user: Option<&str>, message: &ServerMessage) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        for user in room.online_users() {
            if Some(user.id.as_str()) == skip_user {
                continue;
            }
            if let Some(conn) = user.connection {
                self.send(&conn, message.clone());
            }
        }
    }

    /// Drop every room and connection, closing all outboxes
    pub fn clear(&mut self) -> Vec<Room> {
        self.connections.clear();
        self.rooms.drain().map(|(_, room)| room).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Role;

    #[test]
    fn test_broadcast_reaches_online_members_only() {
        let mut registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        registry.add_connection(a, tx_a);
        registry.add_connection(b, tx_b);

        let room = registry.insert_room(Room::new("r1".into(), "ua".into(), 0));
        room.add_user("ua".into(), "A".into(), Role::Host, a);
        room.add_user("ub".into(), "B".into(), Role::Member, b);
        room.user_mut("ub").unwrap().connection = None;

        registry.broadcast("r1", &ServerMessage::UserLeft { user_id: "x".into() });
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        registry.broadcast_except("r1", Some("ua"), &ServerMessage::UserLeft { user_id: "x".into() });
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        registry.add_connection(id, tx);

        registry.bind(&id, "r1".into(), "u1".into());
        assert_eq!(registry.binding(&id), Some(("r1".into(), "u1".into())));
        assert_eq!(registry.unbind(&id), Some(("r1".into(), "u1".into())));
        assert_eq!(registry.binding(&id), None);
    }
}
