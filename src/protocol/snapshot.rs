use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ProtocolState;
use crate::governance::ProposalStatus;
use crate::silo::Epoch;

/// Summary of a protocol state, small enough to print or compare.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    pub height: u64,
    pub epoch: Epoch,
    pub total_stalk: u128,
    pub total_seeds: u128,
    pub total_roots: u128,
    pub active_bips: Vec<u32>,
    pub state_root: String,
}

impl StateSnapshot {
    pub fn of(state: &ProtocolState) -> Self {
        Self {
            height: state.height,
            epoch: state.silo.epoch(),
            total_stalk: state.silo.total_stalk(),
            total_seeds: state.silo.total_seeds(),
            total_roots: state.silo.total_roots(),
            active_bips: state.governance.active_bips(),
            state_root: hex::encode(compute_state_root(state)),
        }
    }
}

fn status_tag(status: ProposalStatus) -> u8 {
    match status {
        ProposalStatus::Active => 0,
        ProposalStatus::Passed => 1,
        ProposalStatus::Expired => 2,
        ProposalStatus::Executed => 3,
    }
}

/// Merkle root over balances, non-empty crates, proposals and votes.
pub fn compute_state_root(state: &ProtocolState) -> [u8; 32] {
    let silo = &state.silo;
    let ledger = silo.ledger();
    let mut leaves: Vec<[u8; 32]> = Vec::new();

    let global = ledger.global();
    let mut hasher = Sha256::new();
    hasher.update(b"global");
    hasher.update(ledger.epoch().to_le_bytes());
    hasher.update(global.total_stalk.to_le_bytes());
    hasher.update(global.total_seeds.to_le_bytes());
    hasher.update(global.total_roots.to_le_bytes());
    hasher.update(global.unclaimed_grown_stalk.to_le_bytes());
    hasher.update(global.reward_pool.to_le_bytes());
    hasher.update(global.reward_per_root.to_le_bytes());
    leaves.push(hasher.finalize().into());

    for (account, balance) in ledger.accounts() {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(account.as_bytes());
        hasher.update(balance.stalk.to_le_bytes());
        hasher.update(balance.seeds.to_le_bytes());
        hasher.update(balance.roots.to_le_bytes());
        hasher.update(balance.last_update.to_le_bytes());
        hasher.update(balance.reward_index.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for deposit in silo.crate_store().iter().filter(|c| c.amount > 0) {
        let mut hasher = Sha256::new();
        hasher.update(b"crate");
        hasher.update(deposit.account.as_bytes());
        hasher.update(deposit.asset.as_bytes());
        hasher.update(deposit.epoch.to_le_bytes());
        hasher.update(deposit.amount.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for proposal in state.governance.proposals() {
        let mut hasher = Sha256::new();
        hasher.update(b"bip");
        hasher.update(proposal.id.to_le_bytes());
        hasher.update(proposal.proposer.as_bytes());
        hasher.update(proposal.start_epoch.to_le_bytes());
        hasher.update(proposal.period.to_le_bytes());
        hasher.update([status_tag(proposal.status)]);
        hasher.update(proposal.roots_for.to_le_bytes());
        hasher.update(proposal.payload.digest());
        leaves.push(hasher.finalize().into());
    }
    for record in state.governance.vote_records() {
        let mut hasher = Sha256::new();
        hasher.update(b"vote");
        hasher.update(record.proposal_id.to_le_bytes());
        hasher.update(record.account.as_bytes());
        hasher.update(record.roots_at_vote.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"silo-state-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
