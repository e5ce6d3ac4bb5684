//! Collaborators the engine calls out to but does not own: the asset
//! transfer service and the upgrade executor.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::governance::ChangePayload;
use crate::silo::{AccountId, Amount, AssetId, Epoch};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("{account} holds {available} {asset}, cannot move {requested}")]
    InsufficientFunds {
        account: AccountId,
        asset: AssetId,
        requested: Amount,
        available: Amount,
    },
    #[error("silo escrow holds {available} {asset}, cannot release {requested}")]
    InsufficientEscrow {
        asset: AssetId,
        requested: Amount,
        available: Amount,
    },
}

/// Moves assets between an account and the Silo. Either call succeeds
/// completely or fails without moving anything.
pub trait AssetTransfer {
    fn move_in(&mut self, account: &AccountId, asset: &AssetId, amount: Amount)
        -> Result<(), TransferError>;
    fn move_out(&mut self, account: &AccountId, asset: &AssetId, amount: Amount)
        -> Result<(), TransferError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("upgrade {digest} rejected: {reason}")]
    Rejected { digest: String, reason: String },
}

/// Applies a passed proposal's change-set atomically.
pub trait UpgradeExecutor {
    fn apply(&mut self, payload: &ChangePayload, epoch: Epoch) -> Result<(), ExecutionError>;
}

/// Wallet balances outside the Silo plus the Silo's escrow, per asset.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InMemoryBank {
    accounts: BTreeMap<AccountId, BTreeMap<AssetId, Amount>>,
    escrow: BTreeMap<AssetId, Amount>,
}

impl InMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit_account(&mut self, account: &AccountId, asset: &AssetId, amount: Amount) {
        let balance = self
            .accounts
            .entry(account.clone())
            .or_default()
            .entry(asset.clone())
            .or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn debit_account(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let available = self.balance_of(account, asset);
        if available < amount {
            return Err(TransferError::InsufficientFunds {
                account: account.clone(),
                asset: asset.clone(),
                requested: amount,
                available,
            });
        }
        if let Some(balance) = self
            .accounts
            .get_mut(account)
            .and_then(|assets| assets.get_mut(asset))
        {
            *balance -= amount;
        }
        Ok(())
    }

    pub fn balance_of(&self, account: &AccountId, asset: &AssetId) -> Amount {
        self.accounts
            .get(account)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(0)
    }

    pub fn escrow_of(&self, asset: &AssetId) -> Amount {
        self.escrow.get(asset).copied().unwrap_or(0)
    }
}

impl AssetTransfer for InMemoryBank {
    fn move_in(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        self.debit_account(account, asset, amount)?;
        let escrow = self.escrow.entry(asset.clone()).or_insert(0);
        *escrow = escrow.saturating_add(amount);
        Ok(())
    }

    fn move_out(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let available = self.escrow_of(asset);
        if available < amount {
            return Err(TransferError::InsufficientEscrow {
                asset: asset.clone(),
                requested: amount,
                available,
            });
        }
        if let Some(escrow) = self.escrow.get_mut(asset) {
            *escrow -= amount;
        }
        self.credit_account(account, asset, amount);
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedUpgrade {
    pub digest: String,
    pub epoch: Epoch,
    pub size: usize,
}

/// Keeps a log of applied change-sets. Payloads whose digest has been
/// marked with [`RecordingExecutor::reject`] fail to apply.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingExecutor {
    applied: Vec<AppliedUpgrade>,
    rejected: BTreeSet<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&mut self, payload: &ChangePayload) {
        self.rejected.insert(hex::encode(payload.digest()));
    }

    pub fn allow(&mut self, payload: &ChangePayload) {
        self.rejected.remove(&hex::encode(payload.digest()));
    }

    pub fn applied(&self) -> &[AppliedUpgrade] {
        &self.applied
    }
}

impl UpgradeExecutor for RecordingExecutor {
    fn apply(&mut self, payload: &ChangePayload, epoch: Epoch) -> Result<(), ExecutionError> {
        let digest = hex::encode(payload.digest());
        if self.rejected.contains(&digest) {
            return Err(ExecutionError::Rejected {
                digest,
                reason: "change-set refused by executor".into(),
            });
        }
        self.applied.push(AppliedUpgrade {
            digest,
            epoch,
            size: payload.len(),
        });
        Ok(())
    }
}
