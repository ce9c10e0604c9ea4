//! Role-based capability table
//!
//! Roles are strictly nested: everything a member may do an admin may do,
//! and everything an admin may do the host may do.

use crate::protocol::VoteAction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a user within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Admin,
    Member,
}

impl Role {
    /// Whether this role keeps its seat through a disconnect
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Host | Role::Admin)
    }

    /// The next role down the hierarchy
    fn inherits(&self) -> Option<Role> {
        match self {
            Role::Host => Some(Role::Admin),
            Role::Admin => Some(Role::Member),
            Role::Member => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Admin => write!(f, "admin"),
            Role::Member => write!(f, "member"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Control,
    Skip,
    Add,
    Remove,
    Update,
    Vote,
    Manage,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Playback,
    Track,
    Queue,
    PlayMode,
    Ballot,
    Role,
    Position,
}

/// One (action, subject) pair granted to a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    pub action: Action,
    pub subject: Subject,
}

impl Capability {
    pub const fn new(action: Action, subject: Subject) -> Self {
        Self { action, subject }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.action, self.subject)
    }
}

const MEMBER: &[Capability] = &[
    Capability::new(Action::Add, Subject::Queue),
    Capability::new(Action::Vote, Subject::Ballot),
];

const ADMIN: &[Capability] = &[
    Capability::new(Action::Control, Subject::Playback),
    Capability::new(Action::Control, Subject::Track),
    Capability::new(Action::Skip, Subject::Track),
    Capability::new(Action::Remove, Subject::Queue),
    Capability::new(Action::Update, Subject::PlayMode),
];

const HOST: &[Capability] = &[
    Capability::new(Action::Manage, Subject::Role),
    Capability::new(Action::Report, Subject::Position),
];

/// Capabilities granted directly to `role`, not counting inherited ones
pub fn direct_capabilities(role: Role) -> &'static [Capability] {
    match role {
        Role::Host => HOST,
        Role::Admin => ADMIN,
        Role::Member => MEMBER,
    }
}

/// Whether `role` may perform `action` on `subject`
pub fn can_perform(role: Role, action: Action, subject: Subject) -> bool {
    let wanted = Capability::new(action, subject);
    let mut current = Some(role);
    while let Some(role) = current {
        if direct_capabilities(role).contains(&wanted) {
            return true;
        }
        current = role.inherits();
    }
    false
}

/// Capability a user needs to perform `action` without a vote
pub fn capability_for(action: &VoteAction) -> Capability {
    match action {
        VoteAction::Skip => Capability::new(Action::Skip, Subject::Track),
        VoteAction::PlayTrack { .. } => Capability::new(Action::Control, Subject::Track),
        VoteAction::Pause | VoteAction::Resume | VoteAction::Seek { .. } => {
            Capability::new(Action::Control, Subject::Playback)
        }
        VoteAction::RemoveTrack { .. } => Capability::new(Action::Remove, Subject::Queue),
        VoteAction::SetPlayMode { .. } => Capability::new(Action::Update, Subject::PlayMode),
    }
}

/// Fails with `PermissionDenied` unless `role` holds `capability`
pub fn require(role: Role, capability: Capability) -> crate::Result<()> {
    if can_perform(role, capability.action, capability.subject) {
        Ok(())
    } else {
        Err(crate::Error::PermissionDenied {
            role: role.to_string(),
            action: capability.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[Capability] = &[
        Capability::new(Action::Control, Subject::Playback),
        Capability::new(Action::Control, Subject::Track),
        Capability::new(Action::Skip, Subject::Track),
        Capability::new(Action::Add, Subject::Queue),
        Capability::new(Action::Remove, Subject::Queue),
        Capability::new(Action::Update, Subject::PlayMode),
        Capability::new(Action::Vote, Subject::Ballot),
        Capability::new(Action::Manage, Subject::Role),
        Capability::new(Action::Report, Subject::Position),
    ];

    #[test]
    fn test_roles_are_nested() {
        for cap in ALL {
            if can_perform(Role::Member, cap.action, cap.subject) {
                assert!(can_perform(Role::Admin, cap.action, cap.subject));
            }
            if can_perform(Role::Admin, cap.action, cap.subject) {
                assert!(can_perform(Role::Host, cap.action, cap.subject));
            }
        }
    }

    #[test]
    fn test_member_needs_vote_for_playback() {
        assert!(!can_perform(Role::Member, Action::Control, Subject::Playback));
        assert!(can_perform(Role::Member, Action::Vote, Subject::Ballot));
        assert!(can_perform(Role::Admin, Action::Control, Subject::Playback));
        assert!(!can_perform(Role::Admin, Action::Manage, Subject::Role));
        assert!(can_perform(Role::Host, Action::Manage, Subject::Role));
    }

    #[test]
    fn test_require_reports_role() {
        let err = require(Role::Member, capability_for(&VoteAction::Skip)).unwrap_err();
        assert!(err.to_string().contains("member"));
        assert!(require(Role::Admin, capability_for(&VoteAction::Skip)).is_ok());
    }
}
