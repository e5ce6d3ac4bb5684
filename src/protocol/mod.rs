//! The protocol aggregate: one owned state object that every deposit,
//! withdrawal, vote and epoch advance passes through.
//!
//! Each public operation is a whole-state transition. Inputs and
//! preconditions are checked before anything is written, so a rejected call
//! leaves the Silo, governance, and the transfer service as they were. The
//! one exception is a fatal [`ProtocolError`], which means the ledger itself
//! is inconsistent.

pub mod snapshot;
pub mod store;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ProtocolConfig;
use crate::governance::{
    ChangePayload, Governance, GovernanceError, ProposalId, ProposalStatus, TallyOutcome,
};
use crate::services::{
    AssetTransfer, ExecutionError, InMemoryBank, RecordingExecutor, TransferError, UpgradeExecutor,
};
use crate::silo::{
    AccountId, Amount, AssetId, Crate, Epoch, Silo, SiloError, SiloReceipt, StalkDelta,
};

pub use snapshot::{compute_state_root, StateSnapshot};
pub use store::{StateFile, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Silo(#[from] SiloError),
    #[error(transparent)]
    Governance(#[from] GovernanceError),
    #[error("asset transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("upgrade execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("epoch must advance past {current}, got {requested}")]
    InvalidEpoch { current: Epoch, requested: Epoch },
}

impl ProtocolError {
    /// True when the error exposes a broken ledger invariant rather than a
    /// bad request.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Silo(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Logs fatal errors loudly on their way out.
fn report<E: Into<ProtocolError>>(err: E) -> ProtocolError {
    let err = err.into();
    if err.is_fatal() {
        error!(%err, "ledger invariant violated");
    }
    err
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Deposit {
        account: AccountId,
        asset: AssetId,
        epoch: Epoch,
        amount: Amount,
    },
    Withdraw {
        account: AccountId,
        asset: AssetId,
        epoch: Epoch,
        amount: Amount,
        stalk: u128,
        seeds: u128,
    },
    SiloAssetsAdded {
        account: AccountId,
        seeds: u128,
        stalk: u128,
    },
    SiloAssetsRemoved {
        account: AccountId,
        seeds: u128,
        stalk: u128,
    },
    EpochAdvanced {
        epoch: Epoch,
        supply_growth: u128,
    },
    Proposed {
        id: ProposalId,
        proposer: AccountId,
        start_epoch: Epoch,
        period: u32,
    },
    Voted {
        id: ProposalId,
        account: AccountId,
        roots: u128,
    },
    Unvoted {
        id: ProposalId,
        account: AccountId,
        roots: u128,
    },
    Passed {
        id: ProposalId,
    },
    Expired {
        id: ProposalId,
    },
    Executed {
        id: ProposalId,
        epoch: Epoch,
    },
}

/// A client request in the serialised execution queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Deposit {
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    },
    Withdraw {
        account: AccountId,
        asset: AssetId,
        epoch: Epoch,
        amount: Amount,
    },
    AddSiloAssets {
        account: AccountId,
        seeds: u128,
        stalk: u128,
    },
    RemoveSiloAssets {
        account: AccountId,
        seeds: u128,
        stalk: u128,
    },
    AdvanceEpoch {
        epoch: Epoch,
        #[serde(default)]
        supply_growth: u128,
    },
    Propose {
        proposer: AccountId,
        payload: ChangePayload,
        #[serde(default)]
        period: Option<u32>,
    },
    Vote {
        voter: AccountId,
        proposal: ProposalId,
    },
    Unvote {
        voter: AccountId,
        proposal: ProposalId,
    },
    Tally {
        proposal: ProposalId,
    },
    Execute {
        proposal: ProposalId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolState {
    pub silo: Silo,
    pub governance: Governance,
    pub events: Vec<Event>,
    /// Number of state transitions applied so far.
    pub height: u64,
}

impl ProtocolState {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            silo: config.build_silo(),
            governance: Governance::new(config.governance.clone()),
            events: Vec::new(),
            height: 0,
        }
    }
}

pub struct Protocol<T = InMemoryBank, U = RecordingExecutor> {
    state: ProtocolState,
    transfer: T,
    executor: U,
}

impl<T: AssetTransfer, U: UpgradeExecutor> Protocol<T, U> {
    pub fn new(config: &ProtocolConfig, transfer: T, executor: U) -> Self {
        Self::from_parts(ProtocolState::new(config), transfer, executor)
    }

    pub fn from_parts(state: ProtocolState, transfer: T, executor: U) -> Self {
        Self {
            state,
            transfer,
            executor,
        }
    }

    pub fn into_parts(self) -> (ProtocolState, T, U) {
        (self.state, self.transfer, self.executor)
    }

    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    pub fn silo(&self) -> &Silo {
        &self.state.silo
    }

    pub fn governance(&self) -> &Governance {
        &self.state.governance
    }

    pub fn events(&self) -> &[Event] {
        &self.state.events
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut T {
        &mut self.transfer
    }

    pub fn executor(&self) -> &U {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut U {
        &mut self.executor
    }

    pub fn epoch(&self) -> Epoch {
        self.state.silo.epoch()
    }

    fn emit(&mut self, event: Event) {
        self.state.events.push(event);
    }

    fn commit(&mut self) {
        self.state.height += 1;
    }

    fn sync_live_weight(&mut self, account: &AccountId) {
        let roots = self.state.silo.balance_of_roots(account);
        self.state.governance.apply_live_weight(account, roots);
    }

    pub fn deposit(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<SiloReceipt, ProtocolError> {
        self.state
            .silo
            .check_deposit(account, asset, amount)
            .map_err(report)?;
        self.transfer.move_in(account, asset, amount)?;
        let receipt = self
            .state
            .silo
            .deposit(account, asset, amount)
            .map_err(report)?;
        self.sync_live_weight(account);
        self.emit(Event::Deposit {
            account: account.clone(),
            asset: asset.clone(),
            epoch: receipt.epoch,
            amount,
        });
        info!(
            %account, %asset, epoch = receipt.epoch, amount,
            seeds = receipt.delta.seeds, stalk = receipt.delta.stalk,
            "deposit"
        );
        self.commit();
        Ok(receipt)
    }

    pub fn withdraw(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<SiloReceipt, ProtocolError> {
        self.state
            .silo
            .check_withdraw(account, asset, epoch, amount)
            .map_err(report)?;
        self.transfer.move_out(account, asset, amount)?;
        let receipt = self
            .state
            .silo
            .withdraw(account, asset, epoch, amount)
            .map_err(report)?;
        self.sync_live_weight(account);
        self.emit(Event::Withdraw {
            account: account.clone(),
            asset: asset.clone(),
            epoch,
            amount,
            stalk: receipt.delta.stalk,
            seeds: receipt.delta.seeds,
        });
        info!(
            %account, %asset, epoch, amount,
            seeds = receipt.delta.seeds, stalk = receipt.delta.stalk,
            roots = receipt.roots.burned,
            "withdraw"
        );
        self.commit();
        Ok(receipt)
    }

    /// Credits stalk and seeds directly, without a crate or a transfer.
    pub fn add_silo_assets(
        &mut self,
        account: &AccountId,
        seeds: u128,
        stalk: u128,
    ) -> Result<(), ProtocolError> {
        self.state
            .silo
            .add_silo_assets(account, StalkDelta { seeds, stalk })
            .map_err(report)?;
        self.sync_live_weight(account);
        self.emit(Event::SiloAssetsAdded {
            account: account.clone(),
            seeds,
            stalk,
        });
        self.commit();
        Ok(())
    }

    pub fn remove_silo_assets(
        &mut self,
        account: &AccountId,
        seeds: u128,
        stalk: u128,
    ) -> Result<(), ProtocolError> {
        self.state
            .silo
            .remove_silo_assets(account, StalkDelta { seeds, stalk })
            .map_err(report)?;
        self.sync_live_weight(account);
        self.emit(Event::SiloAssetsRemoved {
            account: account.clone(),
            seeds,
            stalk,
        });
        self.commit();
        Ok(())
    }

    /// Epoch clock entry point: accrue seed growth, apply supply growth,
    /// then settle every active proposal. Returns the proposals whose status
    /// changed.
    pub fn advance_epoch(
        &mut self,
        new_epoch: Epoch,
        supply_growth: u128,
    ) -> Result<Vec<(ProposalId, ProposalStatus)>, ProtocolError> {
        let current = self.epoch();
        if new_epoch <= current {
            return Err(ProtocolError::InvalidEpoch {
                current,
                requested: new_epoch,
            });
        }
        let applied = self
            .state
            .silo
            .advance_epoch(new_epoch, supply_growth)
            .map_err(report)?;
        if applied < supply_growth {
            warn!(epoch = new_epoch, supply_growth, "supply growth dropped: no roots outstanding");
        }
        self.emit(Event::EpochAdvanced {
            epoch: new_epoch,
            supply_growth: applied,
        });
        info!(epoch = new_epoch, supply_growth = applied, "epoch advanced");

        let total_roots = self.state.silo.total_roots();
        let outcomes = self.state.governance.tally_active(total_roots, new_epoch)?;
        let mut changed = Vec::with_capacity(outcomes.len());
        for (id, outcome) in outcomes {
            changed.push((id, self.settle_outcome(id, outcome)?));
        }
        self.commit();
        Ok(changed)
    }

    pub fn propose(
        &mut self,
        proposer: &AccountId,
        payload: ChangePayload,
        period: Option<u32>,
    ) -> Result<ProposalId, ProtocolError> {
        let roots = self.state.silo.balance_of_roots(proposer);
        let total_roots = self.state.silo.total_roots();
        let epoch = self.epoch();
        let id = self
            .state
            .governance
            .propose(proposer, payload, period, roots, total_roots, epoch)?;
        let period = self
            .state
            .governance
            .proposal(id)
            .map_or(0, |proposal| proposal.period);
        self.emit(Event::Proposed {
            id,
            proposer: proposer.clone(),
            start_epoch: epoch,
            period,
        });
        self.emit(Event::Voted {
            id,
            account: proposer.clone(),
            roots,
        });
        self.settle(id)?;
        self.commit();
        Ok(id)
    }

    /// Casts `voter`'s current roots for the proposal and settles it.
    pub fn vote(&mut self, voter: &AccountId, id: ProposalId) -> Result<ProposalStatus, ProtocolError> {
        let roots = self.state.silo.balance_of_roots(voter);
        let epoch = self.epoch();
        self.state.governance.vote(voter, id, roots, epoch)?;
        self.emit(Event::Voted {
            id,
            account: voter.clone(),
            roots,
        });
        let status = self.settle(id)?;
        self.commit();
        Ok(status)
    }

    pub fn unvote(&mut self, voter: &AccountId, id: ProposalId) -> Result<u128, ProtocolError> {
        let epoch = self.epoch();
        let roots = self.state.governance.unvote(voter, id, epoch)?;
        self.emit(Event::Unvoted {
            id,
            account: voter.clone(),
            roots,
        });
        self.commit();
        Ok(roots)
    }

    /// Explicit quorum/expiry check of one proposal.
    pub fn tally(&mut self, id: ProposalId) -> Result<ProposalStatus, ProtocolError> {
        let status = self.settle(id)?;
        self.commit();
        Ok(status)
    }

    /// Applies a passed proposal's payload. A failed execution leaves the
    /// proposal `Passed`, so the call can be retried.
    pub fn execute(&mut self, id: ProposalId) -> Result<(), ProtocolError> {
        self.run_execution(id)?;
        self.commit();
        Ok(())
    }

    /// Hands the payload to the executor and marks the proposal executed.
    /// Part of whichever transition triggered it; does not commit.
    fn run_execution(&mut self, id: ProposalId) -> Result<(), ProtocolError> {
        let epoch = self.epoch();
        let payload = self.state.governance.pending_execution(id)?.clone();
        if let Err(err) = self.executor.apply(&payload, epoch) {
            warn!(id, %err, "upgrade execution failed, proposal stays passed");
            return Err(err.into());
        }
        self.state.governance.mark_executed(id, epoch)?;
        self.emit(Event::Executed { id, epoch });
        Ok(())
    }

    fn settle(&mut self, id: ProposalId) -> Result<ProposalStatus, ProtocolError> {
        let total_roots = self.state.silo.total_roots();
        let epoch = self.epoch();
        let outcome = self.state.governance.tally(id, total_roots, epoch)?;
        self.settle_outcome(id, outcome)
    }

    fn settle_outcome(
        &mut self,
        id: ProposalId,
        outcome: TallyOutcome,
    ) -> Result<ProposalStatus, ProtocolError> {
        match outcome {
            TallyOutcome::Pending => {}
            TallyOutcome::Expired => self.emit(Event::Expired { id }),
            TallyOutcome::Passed => {
                self.emit(Event::Passed { id });
                match self.run_execution(id) {
                    Ok(()) => {}
                    // Already logged; the proposal stays passed for `execute`.
                    Err(ProtocolError::Execution(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        let proposal = self
            .state
            .governance
            .proposal(id)
            .ok_or(GovernanceError::ProposalNotFound(id))?;
        Ok(proposal.status)
    }

    pub fn apply(&mut self, command: &Command) -> Result<(), ProtocolError> {
        match command {
            Command::Deposit {
                account,
                asset,
                amount,
            } => self.deposit(account, asset, *amount).map(drop),
            Command::Withdraw {
                account,
                asset,
                epoch,
                amount,
            } => self.withdraw(account, asset, *epoch, *amount).map(drop),
            Command::AddSiloAssets {
                account,
                seeds,
                stalk,
            } => self.add_silo_assets(account, *seeds, *stalk),
            Command::RemoveSiloAssets {
                account,
                seeds,
                stalk,
            } => self.remove_silo_assets(account, *seeds, *stalk),
            Command::AdvanceEpoch {
                epoch,
                supply_growth,
            } => self.advance_epoch(*epoch, *supply_growth).map(drop),
            Command::Propose {
                proposer,
                payload,
                period,
            } => self.propose(proposer, payload.clone(), *period).map(drop),
            Command::Vote { voter, proposal } => self.vote(voter, *proposal).map(drop),
            Command::Unvote { voter, proposal } => self.unvote(voter, *proposal).map(drop),
            Command::Tally { proposal } => self.tally(*proposal).map(drop),
            Command::Execute { proposal } => self.execute(*proposal),
        }
    }

    /// Applies commands in order, stopping at the first rejected one.
    /// Returns how many were applied.
    pub fn apply_all<'a, I>(&mut self, commands: I) -> Result<usize, (usize, ProtocolError)>
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut applied = 0;
        for command in commands {
            self.apply(command).map_err(|err| (applied, err))?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn balance_of_stalk(&self, account: &AccountId) -> u128 {
        self.state.silo.balance_of_stalk(account)
    }

    pub fn balance_of_seeds(&self, account: &AccountId) -> u128 {
        self.state.silo.balance_of_seeds(account)
    }

    pub fn balance_of_roots(&self, account: &AccountId) -> u128 {
        self.state.silo.balance_of_roots(account)
    }

    pub fn total_roots(&self) -> u128 {
        self.state.silo.total_roots()
    }

    pub fn crates(&self, account: &AccountId, asset: &AssetId) -> Vec<Crate> {
        self.state.silo.crates(account, asset)
    }

    pub fn active_bips(&self) -> Vec<ProposalId> {
        self.state.governance.active_bips()
    }

    pub fn roots_for(&self, id: ProposalId) -> Result<u128, ProtocolError> {
        Ok(self.state.governance.roots_for(id)?)
    }

    pub fn voted(&self, account: &AccountId, id: ProposalId) -> bool {
        self.state.governance.voted(account, id)
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(&self.state)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::of(&self.state)
    }

    pub fn check_invariants(&self) -> Result<(), ProtocolError> {
        self.state.silo.check_invariants().map_err(report)
    }
}
