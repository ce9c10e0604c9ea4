//! Room membership, role grace periods, host failover and room deletion

mod common;

use common::{settle, wait, Harness, ROOM};
use cosync_core::{ClientMessage, CoordinationConfig, ErrorCode, Role, ServerMessage};
use std::time::Duration;

fn role_of(state: &cosync_core::RoomState, user_id: &str) -> Option<Role> {
    state
        .users
        .iter()
        .find(|u| u.user_id == user_id)
        .map(|u| u.role)
}

fn has_role_change(messages: &[ServerMessage]) -> bool {
    messages
        .iter()
        .any(|m| matches!(m, ServerMessage::RoleChanged { .. } | ServerMessage::UserLeft { .. }))
}

#[tokio::test(start_paused = true)]
async fn test_first_joiner_becomes_host() {
    let harness = Harness::start();
    let mut alice = harness.connect();
    let state = alice.join("alice").await;
    assert_eq!(state.room_id, ROOM);
    assert_eq!(state.host_id, "alice");
    assert_eq!(role_of(&state, "alice"), Some(Role::Host));

    let mut bob = harness.connect();
    let state = bob.join("bob").await;
    assert_eq!(state.host_id, "alice");
    assert_eq!(role_of(&state, "bob"), Some(Role::Member));

    let joined = alice
        .expect(|m| match m {
            ServerMessage::UserJoined { user } => Some(user.clone()),
            _ => None,
        })
        .await;
    assert_eq!(joined.user_id, "bob");
    assert!(joined.online);
    assert_eq!(harness.repository.room_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_host_reconnect_within_grace_keeps_role() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    let mut bob = harness.join("bob").await;

    alice.disconnect();
    wait(Duration::from_secs(10)).await;

    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert_eq!(detail.summary.pending_graces, 1);
    let listed = detail.users.iter().find(|u| u.user_id == "alice").unwrap();
    assert!(!listed.online);
    assert_eq!(listed.role, Role::Host);

    let mut alice = harness.connect();
    let state = alice.join("alice").await;
    assert_eq!(state.host_id, "alice");
    assert_eq!(role_of(&state, "alice"), Some(Role::Host));

    // Past the original grace deadline nothing changes hands
    wait(Duration::from_secs(40)).await;
    settle().await;
    assert!(!has_role_change(&bob.drain()));

    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert_eq!(detail.summary.host_id, "alice");
    assert_eq!(detail.summary.pending_graces, 0);

    let metrics = harness.handle.metrics().snapshot();
    assert_eq!(metrics.graces_started, 1);
    assert_eq!(metrics.graces_restored, 1);
    assert_eq!(metrics.graces_expired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_hands_host_to_admin() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    let mut bob = harness.join("bob").await;
    let _carol = harness.join("carol").await;

    alice.send(ClientMessage::SetRole {
        user_id: "carol".into(),
        role: Role::Admin,
    });
    bob.expect(|m| match m {
        ServerMessage::RoleChanged { user_id, role } if user_id == "carol" => Some(*role),
        _ => None,
    })
    .await;

    alice.disconnect();
    settle().await;
    assert!(!has_role_change(&bob.drain()));

    let new_host = bob
        .expect(|m| match m {
            ServerMessage::RoleChanged {
                user_id,
                role: Role::Host,
            } => Some(user_id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(new_host, "carol");

    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert_eq!(detail.summary.host_id, "carol");
    assert!(detail.users.iter().all(|u| u.user_id != "alice"));
}

#[tokio::test(start_paused = true)]
async fn test_returning_admin_claims_orphaned_host_seat() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    let mut bob = harness.join("bob").await;

    alice.send(ClientMessage::SetRole {
        user_id: "bob".into(),
        role: Role::Admin,
    });
    bob.expect(|m| match m {
        ServerMessage::RoleChanged { user_id, role } if user_id == "bob" => Some(*role),
        _ => None,
    })
    .await;

    alice.disconnect();
    wait(Duration::from_secs(10)).await;
    bob.disconnect();

    // Alice's grace runs out while bob is still inside his own
    wait(Duration::from_secs(25)).await;
    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert!(detail.users.iter().all(|u| u.user_id != "alice"));
    assert_eq!(detail.summary.pending_graces, 1);

    let mut bob = harness.connect();
    let state = bob.join("bob").await;
    assert_eq!(state.host_id, "bob");
    assert_eq!(role_of(&state, "bob"), Some(Role::Host));

    let mut carol = harness.connect();
    let state = carol.join("carol").await;
    assert_eq!(state.host_id, "bob");
    assert_eq!(role_of(&state, "carol"), Some(Role::Member));

    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert_eq!(detail.summary.host_id, "bob");
    assert_eq!(detail.summary.pending_graces, 0);
}

#[tokio::test(start_paused = true)]
async fn test_host_leave_promotes_earliest_member() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    let mut bob = harness.join("bob").await;
    let _carol = harness.join("carol").await;

    alice.send(ClientMessage::Leave);

    let left = bob
        .expect(|m| match m {
            ServerMessage::UserLeft { user_id } => Some(user_id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(left, "alice");
    let new_host = bob
        .expect(|m| match m {
            ServerMessage::RoleChanged {
                user_id,
                role: Role::Host,
            } => Some(user_id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(new_host, "bob");
}

#[tokio::test(start_paused = true)]
async fn test_former_host_returns_as_admin() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    let _bob = harness.join("bob").await;

    alice.send(ClientMessage::Leave);
    settle().await;

    let mut alice = harness.connect();
    let state = alice.join("alice").await;
    assert_eq!(state.host_id, "bob");
    assert_eq!(role_of(&state, "alice"), Some(Role::Admin));
}

#[tokio::test(start_paused = true)]
async fn test_empty_room_deleted_exactly_once() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    alice.send(ClientMessage::Leave);

    wait(Duration::from_secs(30)).await;
    assert_eq!(harness.handle.rooms().await.unwrap().len(), 1);

    wait(Duration::from_secs(31)).await;
    assert!(harness.handle.rooms().await.unwrap().is_empty());
    assert_eq!(harness.repository.room_count(), 0);
    assert_eq!(harness.repository.socket_count(), 0);

    // A late disconnect for the same connection changes nothing
    alice.disconnect();
    wait(Duration::from_secs(120)).await;
    assert_eq!(harness.repository.deletions(), 1);
    assert_eq!(harness.handle.metrics().snapshot().rooms_deleted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_cancels_pending_deletion() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    alice.send(ClientMessage::Leave);
    wait(Duration::from_secs(30)).await;

    let mut carol = harness.connect();
    let state = carol.join("carol").await;
    assert_eq!(state.host_id, "carol");

    wait(Duration::from_secs(120)).await;
    assert_eq!(harness.handle.rooms().await.unwrap().len(), 1);
    assert_eq!(harness.repository.deletions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deletion_waits_for_role_grace() {
    let mut config = CoordinationConfig::default();
    config.lifecycle.room_deletion_grace_ms = 10_000;
    config.lifecycle.role_grace_ms = 30_000;
    let harness = Harness::with_config(config);

    let alice = harness.join("alice").await;
    alice.disconnect();

    wait(Duration::from_secs(15)).await;
    let rooms = harness.handle.rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].pending_graces, 1);

    wait(Duration::from_secs(20)).await;
    assert!(harness.handle.rooms().await.unwrap().is_empty());
    assert_eq!(harness.repository.deletions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_host_seat_goes_to_next_joiner() {
    let harness = Harness::start();
    let alice = harness.join("alice").await;
    alice.disconnect();

    // Grace expires with nobody online to inherit the seat
    wait(Duration::from_secs(40)).await;
    let rooms = harness.handle.rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].listed_users, 0);

    let mut dave = harness.connect();
    let state = dave.join("dave").await;
    assert_eq!(state.host_id, "dave");
    assert_eq!(role_of(&state, "dave"), Some(Role::Host));
}

#[tokio::test(start_paused = true)]
async fn test_stale_disconnect_is_ignored() {
    let harness = Harness::start();
    let first = harness.join("alice").await;
    let mut second = harness.connect();
    second.join("alice").await;

    first.disconnect();
    settle().await;

    let detail = harness.handle.room(ROOM).await.unwrap().unwrap();
    assert_eq!(detail.summary.pending_graces, 0);
    assert_eq!(detail.summary.online_users, 1);
    assert_eq!(detail.users.len(), 1);

    second.send(ClientMessage::SyncRequest);
    second
        .expect(|m| matches!(m, ServerMessage::SyncSnapshot(_)).then_some(()))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_transfer_host_demotes_to_admin() {
    let harness = Harness::start();
    let mut alice = harness.join("alice").await;
    let mut bob = harness.join("bob").await;

    alice.send(ClientMessage::TransferHost {
        user_id: "bob".into(),
    });
    let changes = [
        bob.expect(|m| match m {
            ServerMessage::RoleChanged { user_id, role } => Some((user_id.clone(), *role)),
            _ => None,
        })
        .await,
        bob.expect(|m| match m {
            ServerMessage::RoleChanged { user_id, role } => Some((user_id.clone(), *role)),
            _ => None,
        })
        .await,
    ];
    assert_eq!(changes[0], ("bob".to_string(), Role::Host));
    assert_eq!(changes[1], ("alice".to_string(), Role::Admin));

    // The new host manages roles, the old one no longer can
    alice.send(ClientMessage::SetRole {
        user_id: "bob".into(),
        role: Role::Member,
    });
    assert_eq!(alice.expect_error().await, ErrorCode::PermissionDenied);
}

#[tokio::test(start_paused = true)]
async fn test_commands_before_join_are_rejected() {
    let harness = Harness::start();
    let mut stranger = harness.connect();
    stranger.send(ClientMessage::Skip);
    assert_eq!(stranger.expect_error().await, ErrorCode::NotInRoom);

    stranger.send(ClientMessage::Join {
        room_id: " ".into(),
        user_id: "x".into(),
        nickname: "X".into(),
    });
    assert_eq!(stranger.expect_error().await, ErrorCode::InvalidMessage);
}

#[tokio::test(start_paused = true)]
async fn test_chat_history_survives_for_late_joiners() {
    let harness = Harness::start();
    let mut alice = harness.join("alice").await;
    alice.send(ClientMessage::Chat {
        text: "  hello  ".into(),
    });
    let message = alice
        .expect(|m| match m {
            ServerMessage::Chat { message } => Some(message.clone()),
            _ => None,
        })
        .await;
    assert_eq!(message.text, "hello");
    assert_eq!(message.nickname, "ALICE");

    let mut bob = harness.connect();
    let state = bob.join("bob").await;
    assert_eq!(state.chat_history.len(), 1);
    assert_eq!(state.chat_history[0].text, "hello");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_rooms() {
    let harness = Harness::start();
    let _alice = harness.join("alice").await;
    harness.handle.shutdown().await.unwrap();
    assert_eq!(harness.repository.room_count(), 0);
    assert_eq!(harness.repository.socket_count(), 0);
    assert!(harness.handle.rooms().await.is_err());
}
