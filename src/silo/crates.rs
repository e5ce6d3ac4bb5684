//! Deposit records ("crates") keyed by account, asset and deposit epoch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AccountId, Amount, AssetId, Epoch};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrateError {
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("no {asset} crate for {account} at epoch {epoch}")]
    CrateNotFound {
        account: AccountId,
        asset: AssetId,
        epoch: Epoch,
    },
    #[error("crate holds {available}, cannot withdraw {requested}")]
    InsufficientCrateBalance { requested: Amount, available: Amount },
    #[error("crate balance overflow")]
    Overflow,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crate {
    pub account: AccountId,
    pub asset: AssetId,
    pub epoch: Epoch,
    pub amount: Amount,
}

type AssetCrates = BTreeMap<AssetId, BTreeMap<Epoch, Amount>>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CrateStore {
    crates: BTreeMap<AccountId, AssetCrates>,
    total_deposited: BTreeMap<AssetId, Amount>,
}

impl CrateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_deposit(
        &self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<(), CrateError> {
        if amount == 0 {
            return Err(CrateError::InvalidAmount);
        }
        self.crate_amount(account, asset, epoch)
            .checked_add(amount)
            .ok_or(CrateError::Overflow)?;
        self.total_deposited(asset)
            .checked_add(amount)
            .ok_or(CrateError::Overflow)?;
        Ok(())
    }

    /// Merges `amount` into the crate and returns its new balance.
    pub fn deposit(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<Amount, CrateError> {
        self.check_deposit(account, asset, epoch, amount)?;
        let balance = self
            .crates
            .entry(account.clone())
            .or_default()
            .entry(asset.clone())
            .or_default()
            .entry(epoch)
            .or_insert(0);
        *balance += amount;
        let merged = *balance;
        *self.total_deposited.entry(asset.clone()).or_insert(0) += amount;
        Ok(merged)
    }

    pub fn check_withdraw(
        &self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<(), CrateError> {
        if amount == 0 {
            return Err(CrateError::InvalidAmount);
        }
        let available = self.crate_amount(account, asset, epoch);
        if available == 0 {
            return Err(CrateError::CrateNotFound {
                account: account.clone(),
                asset: asset.clone(),
                epoch,
            });
        }
        if available < amount {
            return Err(CrateError::InsufficientCrateBalance {
                requested: amount,
                available,
            });
        }
        Ok(())
    }

    /// Removes `amount` from the crate deposited at exactly `epoch`. An
    /// emptied crate stays behind as a zero record.
    pub fn withdraw(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<Amount, CrateError> {
        self.check_withdraw(account, asset, epoch, amount)?;
        let not_found = || CrateError::CrateNotFound {
            account: account.clone(),
            asset: asset.clone(),
            epoch,
        };
        let balance = self
            .crates
            .get_mut(account)
            .and_then(|assets| assets.get_mut(asset))
            .and_then(|epochs| epochs.get_mut(&epoch))
            .ok_or_else(not_found)?;
        *balance -= amount;
        if let Some(total) = self.total_deposited.get_mut(asset) {
            *total = total.saturating_sub(amount);
        }
        Ok(amount)
    }

    pub fn crate_amount(&self, account: &AccountId, asset: &AssetId, epoch: Epoch) -> Amount {
        self.crates
            .get(account)
            .and_then(|assets| assets.get(asset))
            .and_then(|epochs| epochs.get(&epoch))
            .copied()
            .unwrap_or(0)
    }

    /// Non-empty crates of one asset, oldest first.
    pub fn crates(&self, account: &AccountId, asset: &AssetId) -> Vec<Crate> {
        self.crates
            .get(account)
            .and_then(|assets| assets.get(asset))
            .into_iter()
            .flat_map(|epochs| epochs.iter())
            .filter(|(_, amount)| **amount > 0)
            .map(|(epoch, amount)| Crate {
                account: account.clone(),
                asset: asset.clone(),
                epoch: *epoch,
                amount: *amount,
            })
            .collect()
    }

    /// Non-empty crates of every asset held by `account`.
    pub fn holdings<'a>(&'a self, account: &'a AccountId) -> impl Iterator<Item = Crate> + 'a {
        self.crates
            .get(account)
            .into_iter()
            .flat_map(move |assets| {
                assets.iter().flat_map(move |(asset, epochs)| {
                    epochs
                        .iter()
                        .filter(|(_, amount)| **amount > 0)
                        .map(move |(epoch, amount)| Crate {
                            account: account.clone(),
                            asset: asset.clone(),
                            epoch: *epoch,
                            amount: *amount,
                        })
                })
            })
    }

    /// Accounts that have ever held a crate.
    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.crates.keys()
    }

    pub fn total_deposited(&self, asset: &AssetId) -> Amount {
        self.total_deposited.get(asset).copied().unwrap_or(0)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Crate> + '_ {
        self.crates.iter().flat_map(|(account, assets)| {
            assets.iter().flat_map(move |(asset, epochs)| {
                epochs.iter().map(move |(epoch, amount)| Crate {
                    account: account.clone(),
                    asset: asset.clone(),
                    epoch: *epoch,
                    amount: *amount,
                })
            })
        })
    }

    /// Sum of every crate of `asset`, compared against the running total.
    pub fn check_totals(&self) -> Result<(), (AssetId, Amount, Amount)> {
        let mut sums: BTreeMap<AssetId, Amount> = BTreeMap::new();
        for entry in self.iter() {
            *sums.entry(entry.asset).or_insert(0) += entry.amount;
        }
        for (asset, total) in &self.total_deposited {
            let sum = sums.remove(asset).unwrap_or(0);
            if sum != *total {
                return Err((asset.clone(), sum, *total));
            }
        }
        match sums.into_iter().find(|(_, sum)| *sum > 0) {
            Some((asset, sum)) => Err((asset, sum, 0)),
            None => Ok(()),
        }
    }
}
