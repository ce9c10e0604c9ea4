//! Room membership: join, leave, disconnect grace and host failover

use super::{Coordinator, TimerKey};
use crate::collaborators::SocketMapping;
use crate::permissions::{self, Action, Capability, Role, Subject};
use crate::protocol::{RoomId, ServerMessage, UserId};
use crate::room::{ConnectionId, GracePeriod, Room};
use crate::{Error, Result};
use tracing::{debug, info};

impl Coordinator {
    pub(super) fn join(
        &mut self,
        conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        nickname: String,
    ) -> Result<()> {
        if room_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(Error::InvalidMessage(
                "room_id and user_id must not be empty".to_string(),
            ));
        }
        if self.registry.connection(&conn).is_none() {
            return Err(Error::InvalidMessage("unknown connection".to_string()));
        }

        if let Some((bound_room, bound_user)) = self.registry.binding(&conn) {
            if bound_room == room_id && bound_user == user_id {
                self.send_room_state(&conn, &room_id, &user_id);
                return Ok(());
            }
            self.leave(conn)?;
        }

        let now = self.clock.now_ms();
        if self.registry.room(&room_id).is_none() {
            self.registry
                .insert_room(Room::new(room_id.clone(), user_id.clone(), now));
            self.metrics.room_created();
            info!(room_id = %room_id, user_id = %user_id, "Room created");
        }

        if self.timers.cancel(&TimerKey::RoomDeletion(room_id.clone())) {
            debug!(room_id = %room_id, "Room deletion cancelled by join");
        }

        let Some(room) = self.registry.room_mut(&room_id) else {
            return Err(Error::NotInRoom);
        };
        room.deletion_deferred = false;

        let mut superseded = None;
        let mut restored = false;
        let mut announce = None;
        let mut promoted_to_host = false;

        match room.user_mut(&user_id) {
            Some(user) => {
                // Same persistent id: either a second tab or a return from grace
                superseded = user.connection.replace(conn);
                user.nickname = nickname;
                if superseded.is_none() {
                    restored = room.graces.remove(&user_id).is_some();
                    let role = room.user(&user_id).map(|u| u.role);
                    if role == Some(Role::Host) {
                        room.host_id = user_id.clone();
                    }
                }
            }
            None => {
                let role = if room.host_is_orphaned() {
                    room.host_id = user_id.clone();
                    promoted_to_host = true;
                    Role::Host
                } else if room.former_hosts.remove(&user_id) {
                    Role::Admin
                } else {
                    Role::Member
                };
                let user = room.add_user(user_id.clone(), nickname, role, conn);
                announce = Some(user.view());
            }
        }

        if let Some(old_conn) = superseded {
            self.registry.unbind(&old_conn);
            self.repository.remove_socket_mapping(&old_conn);
            debug!(
                room_id = %room_id,
                user_id = %user_id,
                old_conn = %old_conn,
                "Connection replaced by a newer one"
            );
        }
        if restored {
            self.timers
                .cancel(&TimerKey::RoleGrace(room_id.clone(), user_id.clone()));
            self.metrics.grace_restored();
            info!(room_id = %room_id, user_id = %user_id, "Role restored within grace period");
        }

        self.registry.bind(&conn, room_id.clone(), user_id.clone());
        if restored
            && self
                .registry
                .room(&room_id)
                .is_some_and(Room::host_is_orphaned)
        {
            // The seat went unclaimed while this user was away
            self.transfer_to_candidate(&room_id);
        }
        self.repository.set_socket_mapping(
            conn,
            SocketMapping {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            },
        );

        if let Some(view) = announce {
            info!(room_id = %room_id, user_id = %user_id, role = %view.role, "User joined");
            self.registry.broadcast_except(
                &room_id,
                Some(&user_id),
                &ServerMessage::UserJoined { user: view },
            );
            if promoted_to_host {
                self.registry.broadcast_except(
                    &room_id,
                    Some(&user_id),
                    &ServerMessage::RoleChanged {
                        user_id: user_id.clone(),
                        role: Role::Host,
                    },
                );
            }
        }

        self.send_room_state(&conn, &room_id, &user_id);
        self.persist(&room_id);
        Ok(())
    }

    fn send_room_state(&self, conn: &ConnectionId, room_id: &str, user_id: &str) {
        let now = self.clock.now_ms();
        if let Some(room) = self.registry.room(room_id) {
            self.registry
                .send(conn, ServerMessage::RoomState(room.state_for(user_id, now)));
        }
    }

    /// Explicit leave: like a disconnect but without a grace period
    pub(super) fn leave(&mut self, conn: ConnectionId) -> Result<()> {
        let (room_id, user_id) = self.registry.unbind(&conn).ok_or(Error::NotInRoom)?;
        self.repository.remove_socket_mapping(&conn);

        let current = self
            .registry
            .room(&room_id)
            .and_then(|room| room.user(&user_id))
            .and_then(|user| user.connection);
        if current != Some(conn) {
            return Ok(());
        }
        self.depart(&room_id, &user_id, false);
        Ok(())
    }

    pub(super) fn handle_disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.registry.remove_connection(&conn) else {
            return;
        };
        self.metrics.connection_closed();
        self.repository.remove_socket_mapping(&conn);

        let Some((room_id, user_id)) = connection.binding else {
            debug!(conn_id = %conn, "Connection closed before joining");
            return;
        };

        let current = self
            .registry
            .room(&room_id)
            .and_then(|room| room.user(&user_id))
            .and_then(|user| user.connection);
        if current != Some(conn) {
            debug!(conn_id = %conn, user_id = %user_id, "Ignoring stale disconnect");
            return;
        }

        self.depart(&room_id, &user_id, true);
    }

    /// Take a user offline
    ///
    /// With `grace`, a host or admin keeps their seat until the grace timer
    /// expires; everyone else leaves immediately.
    fn depart(&mut self, room_id: &str, user_id: &str, grace: bool) {
        let now = self.clock.now_ms();
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let Some(user) = room.user_mut(user_id) else {
            return;
        };
        let role = user.role;

        if grace && role.is_privileged() {
            user.connection = None;
            room.graces.insert(
                user_id.to_string(),
                GracePeriod {
                    user_id: user_id.to_string(),
                    role,
                    started_at: now,
                },
            );
            let delay = self.config.lifecycle.role_grace();
            self.arm_timer(
                TimerKey::RoleGrace(room_id.to_string(), user_id.to_string()),
                delay,
            );
            self.metrics.grace_started();
            info!(
                room_id = %room_id,
                user_id = %user_id,
                role = %role,
                grace_ms = self.config.lifecycle.role_grace_ms,
                "Privileged user disconnected, holding role"
            );
        } else if role == Role::Host {
            self.retire_host(room_id, user_id);
        } else {
            self.remove_user(room_id, user_id);
        }

        self.after_departure(room_id);
    }

    pub(super) fn on_role_grace_expired(&mut self, room_id: &str, user_id: &str) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let Some(grace) = room.graces.remove(user_id) else {
            return;
        };
        self.metrics.grace_expired();
        info!(room_id = %room_id, user_id = %user_id, role = %grace.role, "Role grace expired");

        let still_host = room.host_id == user_id
            && room.user(user_id).map(|u| u.role) == Some(Role::Host);
        if still_host {
            self.retire_host(room_id, user_id);
        } else {
            self.remove_user(room_id, user_id);
        }

        self.finish_deferred_deletion(room_id);
    }

    /// Remove the host, remember them as admin-eligible and pass the seat on
    fn retire_host(&mut self, room_id: &str, user_id: &str) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        room.former_hosts.insert(user_id.to_string());
        self.remove_user(room_id, user_id);
        self.transfer_to_candidate(room_id);
    }

    fn remove_user(&mut self, room_id: &str, user_id: &str) {
        let removed = self
            .registry
            .room_mut(room_id)
            .and_then(|room| room.remove_user(user_id));
        if removed.is_some() {
            info!(room_id = %room_id, user_id = %user_id, "User left");
            self.registry.broadcast(
                room_id,
                &ServerMessage::UserLeft {
                    user_id: user_id.to_string(),
                },
            );
        }
    }

    /// Hand the host seat to the best online candidate, if any
    fn transfer_to_candidate(&mut self, room_id: &str) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let Some(candidate) = room.host_candidate() else {
            info!(room_id = %room_id, host_id = %room.host_id, "No successor online, host seat orphaned");
            return;
        };
        if let Some(user) = room.user_mut(&candidate) {
            user.role = Role::Host;
        }
        room.host_id = candidate.clone();
        info!(room_id = %room_id, user_id = %candidate, "Host transferred");
        self.registry.broadcast(
            room_id,
            &ServerMessage::RoleChanged {
                user_id: candidate,
                role: Role::Host,
            },
        );
        self.persist(room_id);
    }

    /// Start the deletion countdown once nobody is online
    fn after_departure(&mut self, room_id: &str) {
        let Some(room) = self.registry.room(room_id) else {
            return;
        };
        if room.online_count() == 0 {
            let delay = self.config.lifecycle.room_deletion_grace();
            self.arm_timer(TimerKey::RoomDeletion(room_id.to_string()), delay);
            debug!(
                room_id = %room_id,
                grace_ms = self.config.lifecycle.room_deletion_grace_ms,
                "Room empty, deletion scheduled"
            );
        }
        self.persist(room_id);
    }

    pub(super) fn on_room_deletion_timer(&mut self, room_id: &str) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        if room.online_count() > 0 {
            return;
        }
        if !room.graces.is_empty() {
            room.deletion_deferred = true;
            debug!(
                room_id = %room_id,
                pending = room.graces.len(),
                "Deletion deferred until role grace resolves"
            );
            return;
        }
        self.delete_room(room_id);
    }

    fn finish_deferred_deletion(&mut self, room_id: &str) {
        let ready = self.registry.room(room_id).is_some_and(|room| {
            room.deletion_deferred && room.graces.is_empty() && room.online_count() == 0
        });
        if ready {
            self.delete_room(room_id);
        }
    }

    /// Release a room and everything attached to it; idempotent
    pub(super) fn delete_room(&mut self, room_id: &str) {
        let Some(room) = self.registry.remove_room(room_id) else {
            return;
        };
        let timers = self.timers.cancel_where(|key| key.room_id() == room_id);
        for conn in room.users().iter().filter_map(|u| u.connection) {
            self.registry.unbind(&conn);
            self.repository.remove_socket_mapping(&conn);
        }
        self.repository.delete(room_id);
        self.metrics.room_deleted();
        info!(
            room_id = %room_id,
            timers_cancelled = timers,
            queue = room.queue.len(),
            "Room deleted"
        );
    }

    pub(super) fn set_role(&mut self, conn: ConnectionId, target: UserId, role: Role) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, Capability::new(Action::Manage, Subject::Role))?;
        if role == Role::Host {
            return Err(Error::InvalidMessage(
                "use TRANSFER_HOST to change the host".to_string(),
            ));
        }
        if target == member.user_id {
            return Err(Error::InvalidMessage("the host cannot change their own role".to_string()));
        }

        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        let user = room
            .user_mut(&target)
            .ok_or_else(|| Error::UnknownUser(target.clone()))?;
        if user.role == role {
            return Ok(());
        }
        user.role = role;
        if let Some(grace) = room.graces.get_mut(&target) {
            grace.role = role;
        }

        info!(room_id = %member.room_id, user_id = %target, role = %role, "Role changed");
        self.registry.broadcast(
            &member.room_id,
            &ServerMessage::RoleChanged {
                user_id: target,
                role,
            },
        );
        Ok(())
    }

    pub(super) fn transfer_host(&mut self, conn: ConnectionId, target: UserId) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, Capability::new(Action::Manage, Subject::Role))?;
        if target == member.user_id {
            return Ok(());
        }

        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        match room.user_mut(&target) {
            Some(user) if user.is_online() => user.role = Role::Host,
            Some(_) => {
                return Err(Error::InvalidMessage(format!("user {target} is offline")));
            }
            None => return Err(Error::UnknownUser(target)),
        }
        if let Some(old) = room.user_mut(&member.user_id) {
            old.role = Role::Admin;
        }
        room.host_id = target.clone();

        info!(room_id = %member.room_id, from = %member.user_id, to = %target, "Host transferred");
        self.registry.broadcast(
            &member.room_id,
            &ServerMessage::RoleChanged {
                user_id: target,
                role: Role::Host,
            },
        );
        self.registry.broadcast(
            &member.room_id,
            &ServerMessage::RoleChanged {
                user_id: member.user_id,
                role: Role::Admin,
            },
        );
        self.persist(&member.room_id);
        Ok(())
    }
}
