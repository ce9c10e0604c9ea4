//! Coordinator metrics
//!
//! Plain atomic counters, read through [`Metrics::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    rooms_created: AtomicU64,
    rooms_deleted: AtomicU64,
    active_rooms: AtomicU64,

    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU64,

    /// Playback transitions broadcast with an execution time
    actions_scheduled: AtomicU64,
    snapshots_sent: AtomicU64,

    votes_started: AtomicU64,
    votes_passed: AtomicU64,
    votes_failed: AtomicU64,

    graces_started: AtomicU64,
    graces_restored: AtomicU64,
    graces_expired: AtomicU64,

    resolution_failures: AtomicU64,
    commands_rejected: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_secs()),
            ..Default::default()
        }
    }

    pub fn room_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
        self.active_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_deleted(&self) {
        self.rooms_deleted.fetch_add(1, Ordering::Relaxed);
        self.active_rooms.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn action_scheduled(&self) {
        self.actions_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_sent(&self) {
        self.snapshots_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_started(&self) {
        self.votes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_finished(&self, passed: bool) {
        if passed {
            self.votes_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.votes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn grace_started(&self) {
        self.graces_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn grace_restored(&self) {
        self.graces_restored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn grace_expired(&self) {
        self.graces_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resolution_failed(&self) {
        self.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = unix_secs().saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_deleted: self.rooms_deleted.load(Ordering::Relaxed),
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            actions_scheduled: self.actions_scheduled.load(Ordering::Relaxed),
            snapshots_sent: self.snapshots_sent.load(Ordering::Relaxed),
            votes_started: self.votes_started.load(Ordering::Relaxed),
            votes_passed: self.votes_passed.load(Ordering::Relaxed),
            votes_failed: self.votes_failed.load(Ordering::Relaxed),
            graces_started: self.graces_started.load(Ordering::Relaxed),
            graces_restored: self.graces_restored.load(Ordering::Relaxed),
            graces_expired: self.graces_expired.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rooms_created: u64,
    pub rooms_deleted: u64,
    pub active_rooms: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub actions_scheduled: u64,
    pub snapshots_sent: u64,
    pub votes_started: u64,
    pub votes_passed: u64,
    pub votes_failed: u64,
    pub graces_started: u64,
    pub graces_restored: u64,
    pub graces_expired: u64,
    pub resolution_failures: u64,
    pub commands_rejected: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of finished votes that passed
    pub fn vote_pass_rate(&self) -> f64 {
        let finished = self.votes_passed + self.votes_failed;
        if finished == 0 {
            0.0
        } else {
            self.votes_passed as f64 / finished as f64
        }
    }
}
