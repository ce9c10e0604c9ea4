//! Proposals, ballots and vote resolution

use super::{Coordinator, TimerKey};
use crate::consensus::{Vote, VoteOutcome};
use crate::permissions::{self, Action, Capability, Subject};
use crate::protocol::{FailReason, ServerMessage, VoteAction, VoteId};
use crate::room::ConnectionId;
use crate::{Error, Result};
use tracing::{debug, info, warn};

impl Coordinator {
    /// Execute directly when permitted, otherwise open a room vote
    pub(super) fn propose(&mut self, conn: ConnectionId, action: VoteAction) -> Result<()> {
        let member = self.member(&conn)?;
        let room = self.registry.room(&member.room_id).ok_or(Error::NotInRoom)?;
        Self::validate_action(room, &action)?;

        let direct = permissions::capability_for(&action);
        if permissions::can_perform(member.role, direct.action, direct.subject) {
            debug!(room_id = %member.room_id, user_id = %member.user_id, "Proposal executed directly");
            return self.execute_action(&member.room_id, action);
        }
        permissions::require(member.role, Capability::new(Action::Vote, Subject::Ballot))?;

        if room.active_vote.is_some() {
            return Err(Error::VoteInProgress {
                room_id: member.room_id,
            });
        }

        let timeout = self.config.voting.vote_timeout();
        let expires_at = self.clock.now_ms() + timeout.as_millis() as u64;
        let vote = Vote::new(
            action,
            member.user_id.clone(),
            room.online_count(),
            room.host_id.clone(),
            expires_at,
        );
        let started = vote.started();
        let vote_id = vote.id.clone();

        if let Some(room) = self.registry.room_mut(&member.room_id) {
            room.active_vote = Some(vote);
        }
        info!(
            room_id = %member.room_id,
            vote_id = %vote_id,
            initiator = %member.user_id,
            required = started.required_votes,
            total = started.total_users,
            "Vote started"
        );
        self.metrics.vote_started();
        self.registry
            .broadcast(&member.room_id, &ServerMessage::VoteStarted(started));
        self.arm_timer(TimerKey::VoteTimeout(member.room_id.clone(), vote_id), timeout);

        self.resolve_if_decided(&member.room_id);
        Ok(())
    }

    pub(super) fn cast_vote(
        &mut self,
        conn: ConnectionId,
        vote_id: VoteId,
        approve: bool,
    ) -> Result<()> {
        let member = self.member(&conn)?;
        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        let vote = match room.active_vote.as_mut() {
            Some(vote) if vote.id == vote_id => vote,
            _ => return Err(Error::NoActiveVote { vote_id }),
        };
        vote.cast(&member.user_id, approve)?;

        let update = ServerMessage::VoteUpdated {
            id: vote_id,
            approvals: vote.approvals(),
            rejections: vote.rejections(),
        };
        debug!(room_id = %member.room_id, user_id = %member.user_id, approve, "Ballot cast");
        self.registry.broadcast(&member.room_id, &update);

        self.resolve_if_decided(&member.room_id);
        Ok(())
    }

    pub(super) fn on_vote_timeout(&mut self, room_id: &str, vote_id: &str) {
        let active = self
            .registry
            .room(room_id)
            .and_then(|room| room.active_vote.as_ref())
            .is_some_and(|vote| vote.id == vote_id);
        if active {
            self.finish_vote(room_id, VoteOutcome::Failed(FailReason::Timeout));
        }
    }

    fn resolve_if_decided(&mut self, room_id: &str) {
        let outcome = self
            .registry
            .room(room_id)
            .and_then(|room| room.active_vote.as_ref())
            .and_then(Vote::evaluate);
        if let Some(outcome) = outcome {
            self.finish_vote(room_id, outcome);
        }
    }

    /// Clear the vote slot and its timer, act on a pass, announce the result
    fn finish_vote(&mut self, room_id: &str, outcome: VoteOutcome) {
        let Some(vote) = self
            .registry
            .room_mut(room_id)
            .and_then(|room| room.active_vote.take())
        else {
            return;
        };
        self.timers
            .cancel(&TimerKey::VoteTimeout(room_id.to_string(), vote.id.clone()));

        let passed = outcome == VoteOutcome::Passed;
        info!(room_id = %room_id, vote_id = %vote.id, ?outcome, "Vote finished");
        self.metrics.vote_finished(passed);

        if passed {
            if let Err(err) = self.execute_action(room_id, vote.action.clone()) {
                warn!(room_id = %room_id, vote_id = %vote.id, error = %err, "Passed vote could not be applied");
            }
        }
        self.registry
            .broadcast(room_id, &ServerMessage::VoteResult(vote.result(&outcome)));
    }
}
