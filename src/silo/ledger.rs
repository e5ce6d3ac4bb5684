//! Per-account stalk and seed bookkeeping.
//!
//! Seed-driven stalk growth is lazy: each epoch advance only bumps the global
//! `unclaimed_grown_stalk` counter, and an account's share is materialised
//! the next time that account is touched. Supply-growth rewards are lazy
//! the same way, through the reward-per-root index kept by [`RootsEngine`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::roots::RootsEngine;
use super::{AccountId, Amount, Epoch};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("account {account} holds {available} stalk, cannot remove {requested}")]
    InsufficientStalk {
        account: AccountId,
        requested: u128,
        available: u128,
    },
    #[error("account {account} holds {available} seeds, cannot remove {requested}")]
    InsufficientSeeds {
        account: AccountId,
        requested: u128,
        available: u128,
    },
    #[error("amount too large: {0}")]
    AmountTooLarge(&'static str),
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),
}

impl LedgerError {
    /// Overflow of a validated operation or a broken invariant. A shortfall
    /// is a plain precondition here; callers that had already moved a crate
    /// escalate it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Overflow(_) | LedgerError::InvariantViolation(_)
        )
    }
}

/// Stalk and seed credit carried by one deposited unit of an asset.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetParams {
    pub seeds_per_unit: u128,
    pub stalk_per_unit: u128,
}

impl AssetParams {
    pub fn deposit_delta(&self, amount: Amount) -> Result<StalkDelta, LedgerError> {
        Ok(StalkDelta {
            seeds: amount
                .checked_mul(self.seeds_per_unit)
                .ok_or(LedgerError::AmountTooLarge("seeds"))?,
            stalk: amount
                .checked_mul(self.stalk_per_unit)
                .ok_or(LedgerError::AmountTooLarge("stalk"))?,
        })
    }

    /// Base stalk of the withdrawn units plus the stalk their seeds grew
    /// between `deposit_epoch` and `current_epoch`.
    pub fn withdraw_delta(
        &self,
        amount: Amount,
        deposit_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Result<StalkDelta, LedgerError> {
        let base = self.deposit_delta(amount)?;
        let elapsed = u128::from(current_epoch.saturating_sub(deposit_epoch));
        let grown = base
            .seeds
            .checked_mul(elapsed)
            .ok_or(LedgerError::AmountTooLarge("grown stalk"))?;
        Ok(StalkDelta {
            seeds: base.seeds,
            stalk: base
                .stalk
                .checked_add(grown)
                .ok_or(LedgerError::AmountTooLarge("stalk"))?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StalkDelta {
    pub seeds: u128,
    pub stalk: u128,
}

/// Roots moved by one ledger operation, including any roots minted while
/// materialising grown stalk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RootsChange {
    pub minted: u128,
    pub burned: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StalkBalance {
    /// Materialised stalk: deposits, claimed growth and claimed rewards.
    pub stalk: u128,
    pub seeds: u128,
    pub roots: u128,
    /// Epoch up to which grown stalk has been materialised.
    pub last_update: Epoch,
    /// Reward-per-root index at which earned stalk was last claimed.
    #[serde(default)]
    pub reward_index: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GlobalState {
    /// Materialised stalk, including the unclaimed reward pool.
    pub total_stalk: u128,
    pub total_seeds: u128,
    pub total_roots: u128,
    /// Seed growth accrued by epoch advances but not yet credited to accounts.
    pub unclaimed_grown_stalk: u128,
    /// Supply-growth stalk not yet moved into an account's `stalk`.
    pub reward_pool: u128,
    /// Cumulative supply growth per root, scaled by `REWARD_INDEX_SCALE`.
    #[serde(default)]
    pub reward_per_root: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StalkLedger {
    epoch: Epoch,
    roots: RootsEngine,
    accounts: BTreeMap<AccountId, StalkBalance>,
    global: GlobalState,
}

impl StalkLedger {
    pub fn new(genesis_epoch: Epoch, roots: RootsEngine) -> Self {
        Self {
            epoch: genesis_epoch,
            roots,
            accounts: BTreeMap::new(),
            global: GlobalState::default(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    pub fn roots_engine(&self) -> &RootsEngine {
        &self.roots
    }

    pub fn account(&self, account: &AccountId) -> Option<&StalkBalance> {
        self.accounts.get(account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&AccountId, &StalkBalance)> {
        self.accounts.iter()
    }

    fn pending_grown(&self, balance: &StalkBalance) -> u128 {
        let elapsed = u128::from(self.epoch.saturating_sub(balance.last_update));
        balance.seeds.saturating_mul(elapsed)
    }

    fn pending_earned(&self, balance: &StalkBalance) -> u128 {
        self.roots
            .rewards_for(balance.roots, balance.reward_index, self.global.reward_per_root)
    }

    pub fn balance_of_stalk(&self, account: &AccountId) -> u128 {
        self.account(account).map_or(0, |b| {
            b.stalk
                .saturating_add(self.pending_earned(b))
                .saturating_add(self.pending_grown(b))
        })
    }

    pub fn balance_of_grown_stalk(&self, account: &AccountId) -> u128 {
        self.account(account).map_or(0, |b| self.pending_grown(b))
    }

    pub fn balance_of_earned_stalk(&self, account: &AccountId) -> u128 {
        self.account(account).map_or(0, |b| self.pending_earned(b))
    }

    pub fn balance_of_seeds(&self, account: &AccountId) -> u128 {
        self.account(account).map_or(0, |b| b.seeds)
    }

    pub fn balance_of_roots(&self, account: &AccountId) -> u128 {
        self.account(account).map_or(0, |b| b.roots)
    }

    /// Materialised stalk plus growth that has accrued but not been claimed.
    pub fn total_stalk(&self) -> u128 {
        self.global
            .total_stalk
            .saturating_add(self.global.unclaimed_grown_stalk)
    }

    pub fn total_roots(&self) -> u128 {
        self.global.total_roots
    }

    pub fn total_seeds(&self) -> u128 {
        self.global.total_seeds
    }

    /// O(1) epoch accrual: every seed grows one stalk per elapsed epoch.
    pub fn accrue_epoch(&mut self, new_epoch: Epoch) -> Result<u128, LedgerError> {
        if new_epoch < self.epoch {
            return Err(LedgerError::InvariantViolation(format!(
                "epoch moved backwards from {} to {new_epoch}",
                self.epoch
            )));
        }
        let elapsed = u128::from(new_epoch - self.epoch);
        let accrued = self
            .global
            .total_seeds
            .checked_mul(elapsed)
            .ok_or(LedgerError::Overflow("epoch accrual"))?;
        self.global.unclaimed_grown_stalk = self
            .global
            .unclaimed_grown_stalk
            .checked_add(accrued)
            .ok_or(LedgerError::Overflow("unclaimed grown stalk"))?;
        self.epoch = new_epoch;
        debug!(epoch = new_epoch, accrued, "accrued grown stalk");
        Ok(accrued)
    }

    /// Confirms an advance to `new_epoch` with `supply_growth` fits every
    /// total, so the advance itself cannot fail half way.
    pub fn check_advance(&self, new_epoch: Epoch, supply_growth: u128) -> Result<(), LedgerError> {
        if new_epoch < self.epoch {
            return Err(LedgerError::InvariantViolation(format!(
                "epoch moved backwards from {} to {new_epoch}",
                self.epoch
            )));
        }
        let elapsed = u128::from(new_epoch - self.epoch);
        let accrued = self
            .global
            .total_seeds
            .checked_mul(elapsed)
            .ok_or(LedgerError::AmountTooLarge("epoch accrual"))?;
        self.global
            .total_stalk
            .checked_add(self.global.unclaimed_grown_stalk)
            .and_then(|total| total.checked_add(accrued))
            .and_then(|total| total.checked_add(supply_growth))
            .ok_or(LedgerError::AmountTooLarge("total stalk"))?;
        self.roots.check_supply_growth(&self.global, supply_growth)
    }

    pub fn on_supply_growth(&mut self, stalk_minted: u128) -> Result<u128, LedgerError> {
        self.roots.on_supply_growth(&mut self.global, stalk_minted)
    }

    /// Materialises the account's earned rewards and grown stalk, creating
    /// the account on first touch. Returns roots minted for the grown stalk.
    pub fn touch(&mut self, account: &AccountId) -> Result<u128, LedgerError> {
        let epoch = self.epoch;
        let Self {
            roots,
            accounts,
            global,
            ..
        } = self;
        let balance = accounts.entry(account.clone()).or_insert_with(|| StalkBalance {
            last_update: epoch,
            reward_index: global.reward_per_root,
            ..StalkBalance::default()
        });

        // Claimed at the old root balance, before grown stalk mints more.
        let earned = roots.rewards_for(balance.roots, balance.reward_index, global.reward_per_root);
        if earned > global.reward_pool {
            return Err(LedgerError::InvariantViolation(format!(
                "account {account} earned {earned} stalk but the reward pool holds {}",
                global.reward_pool
            )));
        }
        balance.stalk += earned;
        global.reward_pool -= earned;
        balance.reward_index = global.reward_per_root;

        let elapsed = u128::from(epoch.saturating_sub(balance.last_update));
        let grown = balance
            .seeds
            .checked_mul(elapsed)
            .ok_or(LedgerError::Overflow("grown stalk"))?;
        let mut minted = 0;
        if grown > 0 {
            if global.unclaimed_grown_stalk < grown {
                return Err(LedgerError::InvariantViolation(format!(
                    "account {account} grew {grown} stalk but only {} is unclaimed",
                    global.unclaimed_grown_stalk
                )));
            }
            minted = roots.mint_roots(global, balance, grown)?;
            balance.stalk += grown;
            global.total_stalk = global
                .total_stalk
                .checked_add(grown)
                .ok_or(LedgerError::Overflow("total stalk"))?;
            global.unclaimed_grown_stalk -= grown;
        }
        balance.last_update = epoch;
        if earned > 0 || grown > 0 {
            debug!(%account, earned, grown, roots = minted, "materialised stalk");
        }
        Ok(minted)
    }

    /// Confirms crediting `delta`, together with the account's pending
    /// growth, keeps every total and the roots it mints within range.
    pub fn check_add(&self, account: &AccountId, delta: StalkDelta) -> Result<(), LedgerError> {
        let grown = self.account(account).map_or(0, |b| self.pending_grown(b));
        self.global
            .total_stalk
            .checked_add(self.global.unclaimed_grown_stalk)
            .and_then(|total| total.checked_add(delta.stalk))
            .ok_or(LedgerError::AmountTooLarge("total stalk"))?;
        self.global
            .total_seeds
            .checked_add(delta.seeds)
            .ok_or(LedgerError::AmountTooLarge("total seeds"))?;
        // Minting for grown stalk first only lowers the ratio, so one mint
        // at today's ratio bounds both.
        let minted = grown
            .checked_add(delta.stalk)
            .and_then(|stalk| {
                self.roots
                    .roots_for_stalk(stalk, self.global.total_stalk, self.global.total_roots)
                    .ok()
            })
            .and_then(|roots| self.global.total_roots.checked_add(roots));
        if minted.is_none() {
            return Err(LedgerError::AmountTooLarge("total roots"));
        }
        Ok(())
    }

    pub fn add_silo_assets(
        &mut self,
        account: &AccountId,
        delta: StalkDelta,
    ) -> Result<RootsChange, LedgerError> {
        self.check_add(account, delta)?;
        let mut change = RootsChange {
            minted: self.touch(account)?,
            burned: 0,
        };
        let total_stalk = self
            .global
            .total_stalk
            .checked_add(delta.stalk)
            .ok_or(LedgerError::Overflow("total stalk"))?;
        let total_seeds = self
            .global
            .total_seeds
            .checked_add(delta.seeds)
            .ok_or(LedgerError::Overflow("total seeds"))?;
        let Self {
            roots,
            accounts,
            global,
            ..
        } = self;
        let balance = accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::InvariantViolation(format!("account {account} vanished")))?;
        change.minted += roots.mint_roots(global, balance, delta.stalk)?;
        balance.stalk += delta.stalk;
        balance.seeds += delta.seeds;
        global.total_stalk = total_stalk;
        global.total_seeds = total_seeds;
        Ok(change)
    }

    /// Confirms the account can give up `delta` once pending stalk is claimed.
    pub fn check_remove(&self, account: &AccountId, delta: StalkDelta) -> Result<(), LedgerError> {
        let stalk = self.balance_of_stalk(account);
        if stalk < delta.stalk {
            return Err(LedgerError::InsufficientStalk {
                account: account.clone(),
                requested: delta.stalk,
                available: stalk,
            });
        }
        let seeds = self.balance_of_seeds(account);
        if seeds < delta.seeds {
            return Err(LedgerError::InsufficientSeeds {
                account: account.clone(),
                requested: delta.seeds,
                available: seeds,
            });
        }
        Ok(())
    }

    pub fn remove_silo_assets(
        &mut self,
        account: &AccountId,
        delta: StalkDelta,
    ) -> Result<RootsChange, LedgerError> {
        self.check_remove(account, delta)?;
        let minted = self.touch(account)?;
        let Self {
            roots,
            accounts,
            global,
            ..
        } = self;
        let balance = accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::InvariantViolation(format!("account {account} vanished")))?;
        if balance.stalk < delta.stalk || balance.seeds < delta.seeds {
            return Err(LedgerError::InvariantViolation(format!(
                "account {account} fell short after materialising pending stalk"
            )));
        }
        if global.total_stalk < delta.stalk || global.total_seeds < delta.seeds {
            return Err(LedgerError::InvariantViolation(
                "global totals below account balance".into(),
            ));
        }
        let burned = roots.burn_roots(global, balance, delta.stalk)?;
        balance.stalk -= delta.stalk;
        balance.seeds -= delta.seeds;
        global.total_stalk -= delta.stalk;
        global.total_seeds -= delta.seeds;
        Ok(RootsChange { minted, burned })
    }

    pub fn record_deposit(
        &mut self,
        account: &AccountId,
        params: &AssetParams,
        amount: Amount,
    ) -> Result<(StalkDelta, RootsChange), LedgerError> {
        let delta = params.deposit_delta(amount)?;
        let change = self.add_silo_assets(account, delta)?;
        Ok((delta, change))
    }

    pub fn record_withdraw(
        &mut self,
        account: &AccountId,
        params: &AssetParams,
        amount: Amount,
        deposit_epoch: Epoch,
    ) -> Result<(StalkDelta, RootsChange), LedgerError> {
        let delta = params.withdraw_delta(amount, deposit_epoch, self.epoch)?;
        let change = self.remove_silo_assets(account, delta)?;
        Ok((delta, change))
    }

    /// Verifies the conservation invariants across every account.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let mut stalk = 0u128;
        let mut seeds = 0u128;
        let mut roots = 0u128;
        let mut pending = 0u128;
        let mut earned = 0u128;
        for balance in self.accounts.values() {
            stalk = stalk.saturating_add(balance.stalk);
            seeds = seeds.saturating_add(balance.seeds);
            roots = roots.saturating_add(balance.roots);
            pending = pending.saturating_add(self.pending_grown(balance));
            earned = earned.saturating_add(self.pending_earned(balance));
        }
        let global = &self.global;
        if earned > global.reward_pool {
            return Err(LedgerError::InvariantViolation(format!(
                "earned stalk {earned} exceeds reward pool {}",
                global.reward_pool
            )));
        }
        if stalk.saturating_add(global.reward_pool) != global.total_stalk {
            return Err(LedgerError::InvariantViolation(format!(
                "account stalk {stalk} + reward pool {} != total stalk {}",
                global.reward_pool, global.total_stalk
            )));
        }
        if seeds != global.total_seeds {
            return Err(LedgerError::InvariantViolation(format!(
                "account seeds {seeds} != total seeds {}",
                global.total_seeds
            )));
        }
        if roots != global.total_roots {
            return Err(LedgerError::InvariantViolation(format!(
                "account roots {roots} != total roots {}",
                global.total_roots
            )));
        }
        if pending != global.unclaimed_grown_stalk {
            return Err(LedgerError::InvariantViolation(format!(
                "pending grown stalk {pending} != unclaimed {}",
                global.unclaimed_grown_stalk
            )));
        }
        Ok(())
    }
}
