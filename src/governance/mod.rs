//! Root-weighted BIP governance.
//!
//! A proposal moves `Active → Passed → Executed` or `Active → Expired`.
//! Quorum is measured against total roots at the moment of the tally, and
//! weights are read from the Silo only when a vote is cast.

pub mod payload;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{GovernanceParams, VoteWeighting, BPS_DENOMINATOR};
use crate::silo::roots::mul_div_ceil;
use crate::silo::{AccountId, Epoch};

pub use payload::ChangePayload;

pub type ProposalId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernanceError {
    #[error("proposal {0} not found")]
    ProposalNotFound(ProposalId),
    #[error("proposal {0} is not active")]
    ProposalNotActive(ProposalId),
    #[error("{account} already voted on proposal {proposal}")]
    AlreadyVoted {
        account: AccountId,
        proposal: ProposalId,
    },
    #[error("{account} has not voted on proposal {proposal}")]
    NotVoted {
        account: AccountId,
        proposal: ProposalId,
    },
    #[error("{0} holds no roots")]
    NoVotingPower(AccountId),
    #[error("{account} holds {roots} roots, {required} required to propose")]
    InsufficientStakeToPropose {
        account: AccountId,
        roots: u128,
        required: u128,
    },
    #[error("{account} already has {active} active proposals")]
    TooManyActiveProposals { account: AccountId, active: u32 },
    #[error("voting period must be positive")]
    InvalidPeriod,
    #[error("proposal {0} has not passed")]
    ProposalNotPassed(ProposalId),
    #[error("proposal id space exhausted")]
    TooManyProposals,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Passed,
    Expired,
    Executed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposer: AccountId,
    pub start_epoch: Epoch,
    pub period: u32,
    pub payload: ChangePayload,
    pub status: ProposalStatus,
    pub roots_for: u128,
    pub executed_epoch: Option<Epoch>,
}

impl Proposal {
    /// First epoch at which the proposal no longer accepts votes.
    pub fn end_epoch(&self) -> Epoch {
        self.start_epoch.saturating_add(self.period)
    }

    pub fn is_open(&self, epoch: Epoch) -> bool {
        self.status == ProposalStatus::Active && epoch < self.end_epoch()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRecord {
    pub proposal_id: ProposalId,
    pub account: AccountId,
    pub roots_at_vote: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallyOutcome {
    Pending,
    Passed,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Governance {
    params: GovernanceParams,
    proposals: Vec<Proposal>,
    votes: BTreeMap<ProposalId, BTreeMap<AccountId, VoteRecord>>,
    active: BTreeSet<ProposalId>,
}

impl Governance {
    pub fn new(params: GovernanceParams) -> Self {
        Self {
            params,
            proposals: Vec::new(),
            votes: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    pub fn params(&self) -> &GovernanceParams {
        &self.params
    }

    pub fn proposal(&self, id: ProposalId) -> Option<&Proposal> {
        self.proposals.get(id as usize)
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    fn proposal_mut(&mut self, id: ProposalId) -> Result<&mut Proposal, GovernanceError> {
        self.proposals
            .get_mut(id as usize)
            .ok_or(GovernanceError::ProposalNotFound(id))
    }

    /// Ids of every proposal still in the `Active` state, ascending.
    pub fn active_bips(&self) -> Vec<ProposalId> {
        self.active.iter().copied().collect()
    }

    pub fn roots_for(&self, id: ProposalId) -> Result<u128, GovernanceError> {
        self.proposal(id)
            .map(|p| p.roots_for)
            .ok_or(GovernanceError::ProposalNotFound(id))
    }

    pub fn voted(&self, account: &AccountId, id: ProposalId) -> bool {
        self.vote_record(account, id).is_some()
    }

    pub fn vote_record(&self, account: &AccountId, id: ProposalId) -> Option<&VoteRecord> {
        self.votes.get(&id).and_then(|votes| votes.get(account))
    }

    /// Every recorded vote, ordered by proposal then account.
    pub fn vote_records(&self) -> impl Iterator<Item = &VoteRecord> {
        self.votes.values().flat_map(|votes| votes.values())
    }

    /// Roots a proposer needs: the threshold share of total roots, never
    /// less than one.
    pub fn propose_threshold(&self, total_roots: u128) -> u128 {
        mul_div_ceil(
            total_roots,
            u128::from(self.params.propose_threshold_bps),
            BPS_DENOMINATOR,
        )
        .unwrap_or(u128::MAX)
        .max(1)
    }

    /// Roots voting for a proposal that reach quorum at this total.
    pub fn quorum_threshold(&self, total_roots: u128) -> u128 {
        mul_div_ceil(total_roots, u128::from(self.params.quorum_bps), BPS_DENOMINATOR)
            .unwrap_or(u128::MAX)
            .max(1)
    }

    fn active_count(&self, proposer: &AccountId) -> u32 {
        let count = self
            .active
            .iter()
            .filter_map(|id| self.proposal(*id))
            .filter(|p| &p.proposer == proposer)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn check_propose(
        &self,
        proposer: &AccountId,
        period: Option<u32>,
        proposer_roots: u128,
        total_roots: u128,
    ) -> Result<u32, GovernanceError> {
        let period = period.unwrap_or(self.params.voting_period);
        if period == 0 {
            return Err(GovernanceError::InvalidPeriod);
        }
        let required = self.propose_threshold(total_roots);
        if proposer_roots < required {
            return Err(GovernanceError::InsufficientStakeToPropose {
                account: proposer.clone(),
                roots: proposer_roots,
                required,
            });
        }
        if let Some(max) = self.params.max_active_per_proposer {
            let active = self.active_count(proposer);
            if active >= max {
                return Err(GovernanceError::TooManyActiveProposals {
                    account: proposer.clone(),
                    active,
                });
            }
        }
        if ProposalId::try_from(self.proposals.len()).is_err() {
            return Err(GovernanceError::TooManyProposals);
        }
        Ok(period)
    }

    /// Opens a proposal and records the proposer's own vote in favour.
    pub fn propose(
        &mut self,
        proposer: &AccountId,
        payload: ChangePayload,
        period: Option<u32>,
        proposer_roots: u128,
        total_roots: u128,
        epoch: Epoch,
    ) -> Result<ProposalId, GovernanceError> {
        let period = self.check_propose(proposer, period, proposer_roots, total_roots)?;
        let id = ProposalId::try_from(self.proposals.len())
            .map_err(|_| GovernanceError::TooManyProposals)?;
        self.proposals.push(Proposal {
            id,
            proposer: proposer.clone(),
            start_epoch: epoch,
            period,
            payload,
            status: ProposalStatus::Active,
            roots_for: 0,
            executed_epoch: None,
        });
        self.active.insert(id);
        self.record_vote(proposer, id, proposer_roots)?;
        info!(id, %proposer, start_epoch = epoch, period, "proposal opened");
        Ok(id)
    }

    pub fn check_vote(
        &self,
        voter: &AccountId,
        id: ProposalId,
        roots: u128,
        epoch: Epoch,
    ) -> Result<(), GovernanceError> {
        let proposal = self.proposal(id).ok_or(GovernanceError::ProposalNotFound(id))?;
        if !proposal.is_open(epoch) {
            return Err(GovernanceError::ProposalNotActive(id));
        }
        if self.voted(voter, id) {
            return Err(GovernanceError::AlreadyVoted {
                account: voter.clone(),
                proposal: id,
            });
        }
        if roots == 0 {
            return Err(GovernanceError::NoVotingPower(voter.clone()));
        }
        Ok(())
    }

    /// Records `roots` as the voter's weight. The caller runs the tally.
    pub fn vote(
        &mut self,
        voter: &AccountId,
        id: ProposalId,
        roots: u128,
        epoch: Epoch,
    ) -> Result<u128, GovernanceError> {
        self.check_vote(voter, id, roots, epoch)?;
        self.record_vote(voter, id, roots)?;
        info!(id, %voter, roots, "vote recorded");
        Ok(roots)
    }

    fn record_vote(
        &mut self,
        voter: &AccountId,
        id: ProposalId,
        roots: u128,
    ) -> Result<(), GovernanceError> {
        let proposal = self.proposal_mut(id)?;
        proposal.roots_for = proposal.roots_for.saturating_add(roots);
        self.votes.entry(id).or_default().insert(
            voter.clone(),
            VoteRecord {
                proposal_id: id,
                account: voter.clone(),
                roots_at_vote: roots,
            },
        );
        Ok(())
    }

    /// Withdraws a vote from a proposal that is still open.
    pub fn unvote(
        &mut self,
        voter: &AccountId,
        id: ProposalId,
        epoch: Epoch,
    ) -> Result<u128, GovernanceError> {
        let proposal = self.proposal(id).ok_or(GovernanceError::ProposalNotFound(id))?;
        if !proposal.is_open(epoch) {
            return Err(GovernanceError::ProposalNotActive(id));
        }
        let record = self
            .votes
            .get_mut(&id)
            .and_then(|votes| votes.remove(voter))
            .ok_or_else(|| GovernanceError::NotVoted {
                account: voter.clone(),
                proposal: id,
            })?;
        let proposal = self.proposal_mut(id)?;
        proposal.roots_for = proposal.roots_for.saturating_sub(record.roots_at_vote);
        info!(id, %voter, roots = record.roots_at_vote, "vote withdrawn");
        Ok(record.roots_at_vote)
    }

    /// Re-weights the voter's votes on active proposals to `roots`. A no-op
    /// under snapshot weighting.
    pub fn apply_live_weight(&mut self, account: &AccountId, roots: u128) {
        if self.params.vote_weighting != VoteWeighting::Live {
            return;
        }
        let Self {
            proposals,
            votes,
            active,
            ..
        } = self;
        for id in active.iter() {
            let Some(record) = votes.get_mut(id).and_then(|v| v.get_mut(account)) else {
                continue;
            };
            if record.roots_at_vote == roots {
                continue;
            }
            if let Some(proposal) = proposals.get_mut(*id as usize) {
                proposal.roots_for = proposal
                    .roots_for
                    .saturating_sub(record.roots_at_vote)
                    .saturating_add(roots);
            }
            debug!(id, %account, from = record.roots_at_vote, to = roots, "vote re-weighted");
            record.roots_at_vote = roots;
        }
    }

    /// Moves an active proposal to `Passed` once it holds quorum, or to
    /// `Expired` once its period is over.
    pub fn tally(
        &mut self,
        id: ProposalId,
        total_roots: u128,
        epoch: Epoch,
    ) -> Result<TallyOutcome, GovernanceError> {
        let quorum = self.quorum_threshold(total_roots);
        let min_voting_epochs = self.params.min_voting_epochs;
        let proposal = self.proposal_mut(id)?;
        if proposal.status != ProposalStatus::Active {
            return Ok(TallyOutcome::Pending);
        }
        let can_pass = epoch >= proposal.start_epoch.saturating_add(min_voting_epochs);
        let outcome = if can_pass && proposal.roots_for >= quorum {
            proposal.status = ProposalStatus::Passed;
            info!(id, roots_for = proposal.roots_for, total_roots, "proposal passed");
            TallyOutcome::Passed
        } else if epoch >= proposal.end_epoch() {
            proposal.status = ProposalStatus::Expired;
            info!(id, roots_for = proposal.roots_for, total_roots, "proposal expired");
            TallyOutcome::Expired
        } else {
            return Ok(TallyOutcome::Pending);
        };
        self.active.remove(&id);
        Ok(outcome)
    }

    /// Tallies every active proposal, in id order.
    pub fn tally_active(
        &mut self,
        total_roots: u128,
        epoch: Epoch,
    ) -> Result<Vec<(ProposalId, TallyOutcome)>, GovernanceError> {
        let mut outcomes = Vec::new();
        for id in self.active_bips() {
            let outcome = self.tally(id, total_roots, epoch)?;
            if outcome != TallyOutcome::Pending {
                outcomes.push((id, outcome));
            }
        }
        Ok(outcomes)
    }

    /// Payload of a passed proposal awaiting execution.
    pub fn pending_execution(&self, id: ProposalId) -> Result<&ChangePayload, GovernanceError> {
        let proposal = self.proposal(id).ok_or(GovernanceError::ProposalNotFound(id))?;
        if proposal.status != ProposalStatus::Passed {
            return Err(GovernanceError::ProposalNotPassed(id));
        }
        Ok(&proposal.payload)
    }

    pub fn mark_executed(&mut self, id: ProposalId, epoch: Epoch) -> Result<(), GovernanceError> {
        let proposal = self.proposal_mut(id)?;
        if proposal.status != ProposalStatus::Passed {
            return Err(GovernanceError::ProposalNotPassed(id));
        }
        proposal.status = ProposalStatus::Executed;
        proposal.executed_epoch = Some(epoch);
        info!(id, epoch, "proposal executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governance() -> Governance {
        Governance::new(GovernanceParams {
            quorum_bps: 6_000,
            voting_period: 10,
            min_voting_epochs: 2,
            max_active_per_proposer: Some(3),
            ..GovernanceParams::default()
        })
    }

    fn payload() -> ChangePayload {
        ChangePayload::new(b"cut".to_vec())
    }

    #[test]
    fn propose_records_the_proposer_vote() {
        let mut gov = governance();
        let owner = "owner".to_string();
        let id = gov.propose(&owner, payload(), None, 500, 1_000, 1).unwrap();
        assert_eq!(id, 0);
        assert_eq!(gov.roots_for(id).unwrap(), 500);
        assert!(gov.voted(&owner, id));
        assert_eq!(gov.active_bips(), vec![0]);
        assert_eq!(gov.proposal(id).unwrap().end_epoch(), 11);
    }

    #[test]
    fn propose_requires_threshold_stake() {
        let mut gov = governance();
        let err = gov
            .propose(&"minnow".to_string(), payload(), None, 0, 1_000, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InsufficientStakeToPropose { required: 1, .. }
        ));
        // 0.1% of 1_000_000 roots.
        assert!(matches!(
            gov.propose(&"minnow".to_string(), payload(), None, 999, 1_000_000, 1),
            Err(GovernanceError::InsufficientStakeToPropose { required: 1_000, .. })
        ));
        assert!(gov.proposals().is_empty());
    }

    #[test]
    fn proposer_active_limit_is_enforced() {
        let mut gov = governance();
        let owner = "owner".to_string();
        for _ in 0..3 {
            gov.propose(&owner, payload(), None, 100, 1_000, 1).unwrap();
        }
        assert!(matches!(
            gov.propose(&owner, payload(), None, 100, 1_000, 1),
            Err(GovernanceError::TooManyActiveProposals { active: 3, .. })
        ));
        assert!(matches!(
            gov.propose(&owner, payload(), Some(0), 100, 1_000, 1),
            Err(GovernanceError::InvalidPeriod)
        ));
    }

    #[test]
    fn vote_on_a_missing_proposal_records_nothing() {
        let mut gov = governance();
        assert_eq!(
            gov.record_vote(&"user".to_string(), 7, 100),
            Err(GovernanceError::ProposalNotFound(7))
        );
        assert_eq!(gov.vote_records().count(), 0);
    }

    #[test]
    fn double_vote_is_rejected_and_tally_unchanged() {
        let mut gov = governance();
        let (owner, user) = ("owner".to_string(), "user".to_string());
        let id = gov.propose(&owner, payload(), None, 100, 1_000, 1).unwrap();
        gov.vote(&user, id, 200, 1).unwrap();
        assert_eq!(
            gov.vote(&user, id, 200, 1),
            Err(GovernanceError::AlreadyVoted {
                account: user.clone(),
                proposal: id
            })
        );
        assert_eq!(
            gov.vote(&owner, id, 100, 1),
            Err(GovernanceError::AlreadyVoted {
                account: owner,
                proposal: id
            })
        );
        assert_eq!(gov.roots_for(id).unwrap(), 300);
    }

    #[test]
    fn voting_requires_an_open_proposal_and_roots() {
        let mut gov = governance();
        let owner = "owner".to_string();
        let id = gov.propose(&owner, payload(), None, 100, 1_000, 1).unwrap();
        assert_eq!(
            gov.vote(&"ghost".to_string(), id, 0, 1),
            Err(GovernanceError::NoVotingPower("ghost".into()))
        );
        assert_eq!(
            gov.vote(&"late".to_string(), id, 10, 11),
            Err(GovernanceError::ProposalNotActive(id))
        );
        assert_eq!(
            gov.vote(&"lost".to_string(), 7, 10, 1),
            Err(GovernanceError::ProposalNotFound(7))
        );
    }

    #[test]
    fn quorum_waits_for_min_voting_epochs() {
        let mut gov = governance();
        let id = gov
            .propose(&"whale".to_string(), payload(), None, 700, 1_000, 1)
            .unwrap();
        assert_eq!(gov.tally(id, 1_000, 2).unwrap(), TallyOutcome::Pending);
        assert_eq!(gov.tally(id, 1_000, 3).unwrap(), TallyOutcome::Passed);
        assert_eq!(gov.proposal(id).unwrap().status, ProposalStatus::Passed);
        assert!(gov.active_bips().is_empty());
        assert_eq!(
            gov.vote(&"user".to_string(), id, 1, 3),
            Err(GovernanceError::ProposalNotActive(id))
        );
    }

    #[test]
    fn quorum_is_measured_against_total_roots_at_tally_time() {
        let mut gov = governance();
        let id = gov
            .propose(&"owner".to_string(), payload(), None, 600, 1_000, 1)
            .unwrap();
        assert_eq!(gov.tally(id, 1_001, 5).unwrap(), TallyOutcome::Pending);
        assert_eq!(gov.tally(id, 1_000, 5).unwrap(), TallyOutcome::Passed);
    }

    #[test]
    fn proposal_without_quorum_expires() {
        let mut gov = governance();
        let id = gov
            .propose(&"owner".to_string(), payload(), Some(4), 100, 1_000, 1)
            .unwrap();
        assert_eq!(gov.tally(id, 1_000, 4).unwrap(), TallyOutcome::Pending);
        assert_eq!(gov.tally(id, 1_000, 5).unwrap(), TallyOutcome::Expired);
        assert_eq!(gov.proposal(id).unwrap().status, ProposalStatus::Expired);
        assert_eq!(
            gov.pending_execution(id),
            Err(GovernanceError::ProposalNotPassed(id))
        );
    }

    #[test]
    fn execution_is_a_separate_step() {
        let mut gov = governance();
        let id = gov
            .propose(&"whale".to_string(), payload(), None, 900, 1_000, 1)
            .unwrap();
        assert_eq!(
            gov.mark_executed(id, 1),
            Err(GovernanceError::ProposalNotPassed(id))
        );
        gov.tally(id, 1_000, 3).unwrap();
        assert_eq!(gov.pending_execution(id).unwrap(), &payload());
        gov.mark_executed(id, 3).unwrap();
        let proposal = gov.proposal(id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Executed);
        assert_eq!(proposal.executed_epoch, Some(3));
        assert_eq!(
            gov.mark_executed(id, 4),
            Err(GovernanceError::ProposalNotPassed(id))
        );
    }

    #[test]
    fn unvote_removes_recorded_weight() {
        let mut gov = governance();
        let (owner, user) = ("owner".to_string(), "user".to_string());
        let id = gov.propose(&owner, payload(), None, 100, 1_000, 1).unwrap();
        gov.vote(&user, id, 250, 1).unwrap();
        assert_eq!(gov.unvote(&user, id, 2).unwrap(), 250);
        assert_eq!(gov.roots_for(id).unwrap(), 100);
        assert!(!gov.voted(&user, id));
        assert_eq!(
            gov.unvote(&user, id, 2),
            Err(GovernanceError::NotVoted {
                account: user.clone(),
                proposal: id
            })
        );
        gov.vote(&user, id, 50, 2).unwrap();
        assert_eq!(gov.roots_for(id).unwrap(), 150);
    }

    #[test]
    fn snapshot_weighting_ignores_root_changes() {
        let mut gov = governance();
        let user = "user".to_string();
        let id = gov.propose(&user, payload(), None, 400, 1_000, 1).unwrap();
        gov.apply_live_weight(&user, 10);
        assert_eq!(gov.roots_for(id).unwrap(), 400);
    }

    #[test]
    fn live_weighting_tracks_active_proposals_only() {
        let mut gov = Governance::new(GovernanceParams {
            vote_weighting: VoteWeighting::Live,
            voting_period: 5,
            ..GovernanceParams::default()
        });
        let (owner, user) = ("owner".to_string(), "user".to_string());
        let open = gov.propose(&owner, payload(), None, 100, 1_000, 1).unwrap();
        let closed = gov.propose(&owner, payload(), Some(1), 100, 1_000, 1).unwrap();
        gov.vote(&user, open, 400, 1).unwrap();
        gov.vote(&user, closed, 400, 1).unwrap();
        gov.tally(closed, 10_000, 2).unwrap();

        gov.apply_live_weight(&user, 150);
        assert_eq!(gov.roots_for(open).unwrap(), 250);
        assert_eq!(gov.vote_record(&user, open).unwrap().roots_at_vote, 150);
        assert_eq!(gov.roots_for(closed).unwrap(), 500);
    }
}
