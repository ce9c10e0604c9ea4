//! Quorum voting
//!
//! A [`Vote`] records ballots and decides its own outcome. Timers and
//! broadcasting live in the coordinator.

use crate::protocol::{FailReason, UserId, VoteAction, VoteId, VoteResult, VoteStarted};
use crate::time::TimestampMs;
use crate::{Error, Result};
use std::collections::HashMap;

/// Strict majority of `total_users`
pub fn required_votes(total_users: usize) -> usize {
    total_users / 2 + 1
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Passed,
    Failed(FailReason),
}

#[derive(Debug, Clone)]
pub struct Vote {
    pub id: VoteId,
    pub action: VoteAction,
    pub initiator_id: UserId,
    pub ballots: HashMap<UserId, bool>,
    pub required_votes: usize,
    pub total_users: usize,
    pub expires_at: TimestampMs,
    pub host_id: UserId,
}

impl Vote {
    /// Open a vote; the initiator's approval is counted immediately
    pub fn new(
        action: VoteAction,
        initiator_id: UserId,
        total_users: usize,
        host_id: UserId,
        expires_at: TimestampMs,
    ) -> Self {
        let mut ballots = HashMap::new();
        ballots.insert(initiator_id.clone(), true);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            initiator_id,
            ballots,
            required_votes: required_votes(total_users),
            total_users,
            expires_at,
            host_id,
        }
    }

    pub fn cast(&mut self, user_id: &str, approve: bool) -> Result<()> {
        if self.ballots.contains_key(user_id) {
            return Err(Error::AlreadyVoted {
                user_id: user_id.to_string(),
            });
        }
        self.ballots.insert(user_id.to_string(), approve);
        Ok(())
    }

    pub fn approvals(&self) -> usize {
        self.ballots.values().filter(|approve| **approve).count()
    }

    pub fn rejections(&self) -> usize {
        self.ballots.values().filter(|approve| !**approve).count()
    }

    /// Outcome if the vote is decided, checked in priority order
    pub fn evaluate(&self) -> Option<VoteOutcome> {
        if self.ballots.get(&self.host_id) == Some(&false) {
            return Some(VoteOutcome::Failed(FailReason::HostVeto));
        }
        if self.approvals() >= self.required_votes {
            return Some(VoteOutcome::Passed);
        }
        if self.total_users.saturating_sub(self.rejections()) < self.required_votes {
            return Some(VoteOutcome::Failed(FailReason::Rejected));
        }
        None
    }

    pub fn started(&self) -> VoteStarted {
        VoteStarted {
            id: self.id.clone(),
            action: self.action.clone(),
            initiator_id: self.initiator_id.clone(),
            votes: self.approvals(),
            required_votes: self.required_votes,
            total_users: self.total_users,
            expires_at: self.expires_at,
        }
    }

    pub fn result(&self, outcome: &VoteOutcome) -> VoteResult {
        let (passed, reason) = match outcome {
            VoteOutcome::Passed => (true, None),
            VoteOutcome::Failed(reason) => (false, Some(*reason)),
        };
        VoteResult {
            id: self.id.clone(),
            passed,
            action: self.action.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(total: usize) -> Vote {
        Vote::new(VoteAction::Skip, "m1".into(), total, "host".into(), 30_000)
    }

    #[test]
    fn test_required_votes() {
        assert_eq!(required_votes(1), 1);
        assert_eq!(required_votes(2), 2);
        assert_eq!(required_votes(3), 2);
        assert_eq!(required_votes(4), 3);
        assert_eq!(required_votes(5), 3);
    }

    #[test]
    fn test_passes_on_third_of_five() {
        let mut v = vote(5);
        assert_eq!(v.evaluate(), None);
        v.cast("m2", true).unwrap();
        assert_eq!(v.evaluate(), None);
        v.cast("m3", true).unwrap();
        assert_eq!(v.evaluate(), Some(VoteOutcome::Passed));
    }

    #[test]
    fn test_two_users_need_unanimity() {
        let mut v = vote(2);
        assert_eq!(v.required_votes, 2);
        assert_eq!(v.evaluate(), None);
        v.cast("m2", false).unwrap();
        assert_eq!(v.evaluate(), Some(VoteOutcome::Failed(FailReason::Rejected)));
    }

    #[test]
    fn test_host_veto_overrides_quorum() {
        let mut v = vote(5);
        v.cast("m2", true).unwrap();
        v.cast("m3", true).unwrap();
        v.cast("host", false).unwrap();
        assert_eq!(v.evaluate(), Some(VoteOutcome::Failed(FailReason::HostVeto)));
    }

    #[test]
    fn test_quorum_impossible() {
        let mut v = vote(5);
        v.cast("m2", false).unwrap();
        v.cast("m3", false).unwrap();
        assert_eq!(v.evaluate(), None);
        v.cast("m4", false).unwrap();
        assert_eq!(v.evaluate(), Some(VoteOutcome::Failed(FailReason::Rejected)));
    }

    #[test]
    fn test_single_ballot_per_user() {
        let mut v = vote(5);
        assert!(matches!(v.cast("m1", false), Err(Error::AlreadyVoted { .. })));
        v.cast("m2", true).unwrap();
        assert!(matches!(v.cast("m2", true), Err(Error::AlreadyVoted { .. })));
        assert_eq!(v.approvals(), 2);
    }
}
