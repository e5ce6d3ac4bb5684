//! The Silo: pooled deposits and the stalk, seed and root credit they earn.
//!
//! [`Silo`] wires the three layers together in a fixed order. A crate is
//! checked first, then the ledger projects the stalk and seed delta, and only
//! when every check passes is anything written. Checks that fail leave the
//! Silo untouched. Once a crate has moved, any ledger failure means the two
//! layers disagree and is reported as an invariant violation.

pub mod crates;
pub mod ledger;
pub mod roots;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use crates::{Crate, CrateError, CrateStore};
pub use ledger::{
    AssetParams, GlobalState, LedgerError, RootsChange, StalkBalance, StalkDelta, StalkLedger,
};
pub use roots::RootsEngine;

pub type AccountId = String;
pub type AssetId = String;
pub type Epoch = u32;
pub type Amount = u128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiloError {
    #[error("unknown asset {0}")]
    UnknownAsset(AssetId),
    #[error(transparent)]
    Crate(#[from] CrateError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SiloError {
    pub fn is_fatal(&self) -> bool {
        match self {
            SiloError::Ledger(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Wraps a ledger failure that can only come from crates and ledger
/// disagreeing.
fn out_of_step(err: LedgerError) -> SiloError {
    SiloError::Ledger(LedgerError::InvariantViolation(format!(
        "crates and ledger out of step: {err}"
    )))
}

/// What a successful deposit or withdrawal changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SiloReceipt {
    pub epoch: Epoch,
    pub amount: Amount,
    pub delta: StalkDelta,
    pub roots: RootsChange,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Silo {
    assets: BTreeMap<AssetId, AssetParams>,
    crates: CrateStore,
    ledger: StalkLedger,
}

impl Silo {
    pub fn new(
        assets: BTreeMap<AssetId, AssetParams>,
        genesis_epoch: Epoch,
        roots: RootsEngine,
    ) -> Self {
        Self {
            assets,
            crates: CrateStore::new(),
            ledger: StalkLedger::new(genesis_epoch, roots),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.ledger.epoch()
    }

    pub fn asset(&self, asset: &AssetId) -> Result<&AssetParams, SiloError> {
        self.assets
            .get(asset)
            .ok_or_else(|| SiloError::UnknownAsset(asset.clone()))
    }

    pub fn assets(&self) -> &BTreeMap<AssetId, AssetParams> {
        &self.assets
    }

    pub fn ledger(&self) -> &StalkLedger {
        &self.ledger
    }

    pub fn crate_store(&self) -> &CrateStore {
        &self.crates
    }

    pub fn check_deposit(
        &self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<StalkDelta, SiloError> {
        let params = self.asset(asset)?;
        self.crates.check_deposit(account, asset, self.epoch(), amount)?;
        let delta = params.deposit_delta(amount)?;
        self.ledger.check_add(account, delta)?;
        Ok(delta)
    }

    /// Deposits into the crate of the current epoch.
    pub fn deposit(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<SiloReceipt, SiloError> {
        self.check_deposit(account, asset, amount)?;
        let params = *self.asset(asset)?;
        let epoch = self.epoch();
        self.crates.deposit(account, asset, epoch, amount)?;
        let (delta, roots) = self
            .ledger
            .record_deposit(account, &params, amount)
            .map_err(out_of_step)?;
        Ok(SiloReceipt {
            epoch,
            amount,
            delta,
            roots,
        })
    }

    pub fn check_withdraw(
        &self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<StalkDelta, SiloError> {
        let params = self.asset(asset)?;
        self.crates.check_withdraw(account, asset, epoch, amount)?;
        let delta = params.withdraw_delta(amount, epoch, self.epoch())?;
        self.ledger.check_remove(account, delta).map_err(out_of_step)?;
        Ok(delta)
    }

    /// Withdraws from the crate deposited at exactly `epoch`.
    pub fn withdraw(
        &mut self,
        account: &AccountId,
        asset: &AssetId,
        epoch: Epoch,
        amount: Amount,
    ) -> Result<SiloReceipt, SiloError> {
        self.check_withdraw(account, asset, epoch, amount)?;
        let params = *self.asset(asset)?;
        let removed = self.crates.withdraw(account, asset, epoch, amount)?;
        let (delta, roots) = self
            .ledger
            .record_withdraw(account, &params, removed, epoch)
            .map_err(out_of_step)?;
        Ok(SiloReceipt {
            epoch,
            amount: removed,
            delta,
            roots,
        })
    }

    /// Credits stalk and seeds that are not backed by a crate.
    pub fn add_silo_assets(
        &mut self,
        account: &AccountId,
        delta: StalkDelta,
    ) -> Result<RootsChange, SiloError> {
        Ok(self.ledger.add_silo_assets(account, delta)?)
    }

    /// Seeds and stalk (base plus grown) that the account's crates would
    /// take back if every one of them were withdrawn now.
    pub fn crate_backing(&self, account: &AccountId) -> Result<StalkDelta, SiloError> {
        let mut backing = StalkDelta::default();
        for held in self.crates.holdings(account) {
            let delta = self
                .asset(&held.asset)?
                .withdraw_delta(held.amount, held.epoch, self.epoch())?;
            backing.seeds = backing
                .seeds
                .checked_add(delta.seeds)
                .ok_or(LedgerError::AmountTooLarge("crate seeds"))?;
            backing.stalk = backing
                .stalk
                .checked_add(delta.stalk)
                .ok_or(LedgerError::AmountTooLarge("crate stalk"))?;
        }
        Ok(backing)
    }

    /// Only credit that no crate relies on can be removed directly.
    pub fn check_remove_silo_assets(
        &self,
        account: &AccountId,
        delta: StalkDelta,
    ) -> Result<(), SiloError> {
        let backing = self.crate_backing(account)?;
        let stalk = self.balance_of_stalk(account).saturating_sub(backing.stalk);
        if stalk < delta.stalk {
            return Err(LedgerError::InsufficientStalk {
                account: account.clone(),
                requested: delta.stalk,
                available: stalk,
            }
            .into());
        }
        let seeds = self.balance_of_seeds(account).saturating_sub(backing.seeds);
        if seeds < delta.seeds {
            return Err(LedgerError::InsufficientSeeds {
                account: account.clone(),
                requested: delta.seeds,
                available: seeds,
            }
            .into());
        }
        Ok(())
    }

    pub fn remove_silo_assets(
        &mut self,
        account: &AccountId,
        delta: StalkDelta,
    ) -> Result<RootsChange, SiloError> {
        self.check_remove_silo_assets(account, delta)?;
        Ok(self.ledger.remove_silo_assets(account, delta)?)
    }

    /// Claims the account's pending grown and earned stalk.
    pub fn touch(&mut self, account: &AccountId) -> Result<u128, SiloError> {
        Ok(self.ledger.touch(account)?)
    }

    /// Applies an epoch advance: seed accrual for the elapsed epochs, then
    /// supply growth. Returns the supply growth actually applied.
    pub fn advance_epoch(&mut self, new_epoch: Epoch, supply_growth: u128) -> Result<u128, SiloError> {
        self.check_advance(new_epoch, supply_growth)?;
        self.ledger.accrue_epoch(new_epoch)?;
        Ok(self.ledger.on_supply_growth(supply_growth)?)
    }

    pub fn check_advance(&self, new_epoch: Epoch, supply_growth: u128) -> Result<(), SiloError> {
        Ok(self.ledger.check_advance(new_epoch, supply_growth)?)
    }

    pub fn balance_of_stalk(&self, account: &AccountId) -> u128 {
        self.ledger.balance_of_stalk(account)
    }

    pub fn balance_of_grown_stalk(&self, account: &AccountId) -> u128 {
        self.ledger.balance_of_grown_stalk(account)
    }

    pub fn balance_of_earned_stalk(&self, account: &AccountId) -> u128 {
        self.ledger.balance_of_earned_stalk(account)
    }

    pub fn balance_of_seeds(&self, account: &AccountId) -> u128 {
        self.ledger.balance_of_seeds(account)
    }

    pub fn balance_of_roots(&self, account: &AccountId) -> u128 {
        self.ledger.balance_of_roots(account)
    }

    pub fn total_stalk(&self) -> u128 {
        self.ledger.total_stalk()
    }

    pub fn total_seeds(&self) -> u128 {
        self.ledger.total_seeds()
    }

    pub fn total_roots(&self) -> u128 {
        self.ledger.total_roots()
    }

    pub fn crate_amount(&self, account: &AccountId, asset: &AssetId, epoch: Epoch) -> Amount {
        self.crates.crate_amount(account, asset, epoch)
    }

    pub fn crates(&self, account: &AccountId, asset: &AssetId) -> Vec<Crate> {
        self.crates.crates(account, asset)
    }

    pub fn total_deposited(&self, asset: &AssetId) -> Amount {
        self.crates.total_deposited(asset)
    }

    pub fn check_invariants(&self) -> Result<(), SiloError> {
        self.ledger.check_invariants()?;
        self.crates.check_totals().map_err(|(asset, sum, total)| {
            LedgerError::InvariantViolation(format!(
                "{asset} crates sum to {sum}, total deposited is {total}"
            ))
        })?;
        for account in self.crates.accounts() {
            let backing = self.crate_backing(account)?;
            let (seeds, stalk) = (self.balance_of_seeds(account), self.balance_of_stalk(account));
            if backing.seeds > seeds || backing.stalk > stalk {
                return Err(LedgerError::InvariantViolation(format!(
                    "{account} crates need {} seeds and {} stalk, ledger holds {seeds} and {stalk}",
                    backing.seeds, backing.stalk
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silo() -> Silo {
        let mut assets = BTreeMap::new();
        assets.insert(
            "bean".to_string(),
            AssetParams {
                seeds_per_unit: 2,
                stalk_per_unit: 10_000,
            },
        );
        Silo::new(assets, 1, RootsEngine::default())
    }

    fn bean() -> AssetId {
        "bean".to_string()
    }

    #[test]
    fn bean_deposit_credits_seeds_stalk_and_crate() {
        let mut silo = silo();
        let user = "user".to_string();
        silo.advance_epoch(2, 0).unwrap();
        let receipt = silo.deposit(&user, &bean(), 1_000).unwrap();
        assert_eq!(receipt.epoch, 2);
        assert_eq!(silo.balance_of_seeds(&user), 2_000);
        assert_eq!(silo.balance_of_grown_stalk(&user), 0);
        assert_eq!(silo.balance_of_stalk(&user), 10_000_000);
        assert_eq!(silo.crate_amount(&user, &bean(), 2), 1_000);
        silo.check_invariants().unwrap();
    }

    #[test]
    fn unknown_asset_and_zero_amount_are_rejected() {
        let mut silo = silo();
        let user = "user".to_string();
        assert_eq!(
            silo.deposit(&user, &"lp".to_string(), 5),
            Err(SiloError::UnknownAsset("lp".into()))
        );
        assert_eq!(
            silo.deposit(&user, &bean(), 0),
            Err(SiloError::Crate(CrateError::InvalidAmount))
        );
        assert_eq!(silo.total_stalk(), 0);
        assert!(silo.ledger().account(&user).is_none());
    }

    #[test]
    fn deposit_then_withdraw_restores_balances() {
        let mut silo = silo();
        let (alice, bob) = ("alice".to_string(), "bob".to_string());
        silo.deposit(&alice, &bean(), 700).unwrap();
        silo.advance_epoch(3, 0).unwrap();
        silo.touch(&alice).unwrap();
        let before = (
            silo.balance_of_stalk(&alice),
            silo.balance_of_seeds(&alice),
            silo.balance_of_roots(&alice),
        );

        silo.deposit(&bob, &bean(), 10).unwrap();
        silo.deposit(&alice, &bean(), 333).unwrap();
        silo.withdraw(&alice, &bean(), 3, 333).unwrap();

        assert_eq!(
            (
                silo.balance_of_stalk(&alice),
                silo.balance_of_seeds(&alice),
                silo.balance_of_roots(&alice),
            ),
            before
        );
        silo.check_invariants().unwrap();
    }

    #[test]
    fn failed_withdrawal_leaves_state_unchanged() {
        let mut silo = silo();
        let user = "user".to_string();
        silo.deposit(&user, &bean(), 100).unwrap();
        silo.advance_epoch(4, 0).unwrap();
        let before = silo.clone();
        assert!(matches!(
            silo.withdraw(&user, &bean(), 2, 1),
            Err(SiloError::Crate(CrateError::CrateNotFound { .. }))
        ));
        assert!(matches!(
            silo.withdraw(&user, &bean(), 1, 101),
            Err(SiloError::Crate(CrateError::InsufficientCrateBalance { .. }))
        ));
        assert_eq!(silo, before);
    }

    #[test]
    fn partial_withdrawal_burns_pro_rated_growth() {
        let mut silo = silo();
        let user = "user".to_string();
        silo.deposit(&user, &bean(), 100).unwrap();
        silo.advance_epoch(11, 0).unwrap();
        // 100 beans grew 200 seeds * 10 epochs of stalk.
        assert_eq!(silo.balance_of_stalk(&user), 1_002_000);
        let receipt = silo.withdraw(&user, &bean(), 1, 25).unwrap();
        assert_eq!(receipt.delta.stalk, 250_000 + 50 * 10);
        assert_eq!(silo.balance_of_stalk(&user), 751_500);
        assert_eq!(silo.balance_of_seeds(&user), 150);
        assert_eq!(silo.crate_amount(&user, &bean(), 1), 75);
        silo.check_invariants().unwrap();
    }

    #[test]
    fn credit_backing_crates_cannot_be_removed_directly() {
        let mut silo = silo();
        let user = "user".to_string();
        silo.deposit(&user, &bean(), 100).unwrap();
        silo.add_silo_assets(&user, StalkDelta { seeds: 10, stalk: 50 })
            .unwrap();
        silo.advance_epoch(3, 0).unwrap();
        assert_eq!(
            silo.crate_backing(&user).unwrap(),
            StalkDelta { seeds: 200, stalk: 1_000_400 }
        );

        let before = silo.clone();
        let err = silo
            .remove_silo_assets(&user, StalkDelta { seeds: 11, stalk: 0 })
            .unwrap_err();
        assert!(matches!(
            err,
            SiloError::Ledger(LedgerError::InsufficientSeeds { available: 10, .. })
        ));
        assert!(!err.is_fatal());
        assert_eq!(silo, before);

        // 50 unbacked stalk plus the 20 grown by the unbacked seeds.
        silo.remove_silo_assets(&user, StalkDelta { seeds: 10, stalk: 70 })
            .unwrap();
        silo.withdraw(&user, &bean(), 1, 100).unwrap();
        assert_eq!(silo.balance_of_stalk(&user), 0);
        silo.check_invariants().unwrap();
    }

    #[test]
    fn ledger_shortfall_behind_a_crate_is_fatal() {
        let mut silo = silo();
        let user = "user".to_string();
        silo.deposit(&user, &bean(), 100).unwrap();
        silo.ledger
            .remove_silo_assets(&user, StalkDelta { seeds: 200, stalk: 1_000_000 })
            .unwrap();

        let err = silo.check_invariants().unwrap_err();
        assert!(err.is_fatal());
        let err = silo.withdraw(&user, &bean(), 1, 100).unwrap_err();
        assert!(matches!(err, SiloError::Ledger(LedgerError::InvariantViolation(_))));
        assert!(err.is_fatal());
        assert_eq!(silo.crate_amount(&user, &bean(), 1), 100);
    }

    #[test]
    fn oversized_deposit_is_rejected_before_the_crate_moves() {
        let mut silo = silo();
        let user = "user".to_string();
        let amount = u128::MAX / 10_000 - 1;
        silo.deposit(&user, &bean(), amount).unwrap();
        let before = silo.clone();
        let err = silo.deposit(&user, &bean(), amount).unwrap_err();
        assert_eq!(err, SiloError::Ledger(LedgerError::AmountTooLarge("total stalk")));
        assert!(!err.is_fatal());
        assert_eq!(silo, before);
        silo.check_invariants().unwrap();
    }

    #[test]
    fn oversized_supply_growth_leaves_the_epoch_alone() {
        let mut silo = silo();
        silo.deposit(&"user".to_string(), &bean(), 10).unwrap();
        let before = silo.clone();
        let err = silo.advance_epoch(5, u128::MAX).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(silo, before);
        assert_eq!(silo.epoch(), 1);
    }

    #[test]
    fn supply_growth_rebases_by_root_share() {
        let mut silo = silo();
        let (alice, bob) = ("alice".to_string(), "bob".to_string());
        silo.deposit(&alice, &bean(), 3).unwrap();
        silo.deposit(&bob, &bean(), 1).unwrap();
        let (a0, b0) = (silo.balance_of_stalk(&alice), silo.balance_of_stalk(&bob));
        let roots_before = silo.total_roots();

        silo.advance_epoch(2, 1_000_001).unwrap();

        assert_eq!(silo.total_roots(), roots_before);
        let growth = 1_000_001u128;
        let expected_a = growth * silo.balance_of_roots(&alice) / silo.total_roots();
        let expected_b = growth * silo.balance_of_roots(&bob) / silo.total_roots();
        let grown_a = silo.balance_of_grown_stalk(&alice);
        let grown_b = silo.balance_of_grown_stalk(&bob);
        assert!((silo.balance_of_stalk(&alice) - a0 - grown_a).abs_diff(expected_a) <= 1);
        assert!((silo.balance_of_stalk(&bob) - b0 - grown_b).abs_diff(expected_b) <= 1);
        silo.check_invariants().unwrap();
    }
}
