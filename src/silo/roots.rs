//! Proportional ownership ("roots") of the Silo's total stalk.
//!
//! Roots are minted and burned only when an account's own stalk changes.
//! Supply growth adds stalk to the global total without minting roots, so
//! every existing root silently represents more stalk afterwards. Each
//! growth event raises a global reward-per-root index; an account is owed
//! its roots times the index movement since it was last touched.

use serde::{Deserialize, Serialize};

use super::ledger::{GlobalState, LedgerError, StalkBalance};

/// Roots minted per unit of stalk while the Silo has no roots at all.
pub const DEFAULT_BOOTSTRAP_ROOTS_PER_STALK: u128 = 1;

/// Fixed-point scale of the reward-per-root index.
pub const REWARD_INDEX_SCALE: u128 = 1_000_000_000_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootsEngine {
    bootstrap_roots_per_stalk: u128,
}

impl Default for RootsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BOOTSTRAP_ROOTS_PER_STALK)
    }
}

impl RootsEngine {
    pub fn new(bootstrap_roots_per_stalk: u128) -> Self {
        Self {
            bootstrap_roots_per_stalk: bootstrap_roots_per_stalk.max(1),
        }
    }

    pub fn bootstrap_roots_per_stalk(&self) -> u128 {
        self.bootstrap_roots_per_stalk
    }

    /// Roots owed for `stalk_added` at the current global ratio, rounded down.
    pub fn roots_for_stalk(
        &self,
        stalk_added: u128,
        total_stalk: u128,
        total_roots: u128,
    ) -> Result<u128, LedgerError> {
        if total_roots == 0 || total_stalk == 0 {
            return stalk_added
                .checked_mul(self.bootstrap_roots_per_stalk)
                .ok_or(LedgerError::Overflow("bootstrap roots"));
        }
        mul_div_floor(stalk_added, total_roots, total_stalk).ok_or(LedgerError::Overflow("mint roots"))
    }

    /// Roots removed with `stalk_removed`, relative to the account's own
    /// ratio and rounded up. Removing all stalk removes all roots.
    pub fn roots_to_burn(
        &self,
        stalk_removed: u128,
        account_stalk: u128,
        account_roots: u128,
    ) -> Result<u128, LedgerError> {
        if stalk_removed == 0 {
            return Ok(0);
        }
        if stalk_removed >= account_stalk {
            return Ok(account_roots);
        }
        let roots = mul_div_ceil(stalk_removed, account_roots, account_stalk)
            .ok_or(LedgerError::Overflow("burn roots"))?;
        Ok(roots.min(account_roots))
    }

    /// Credits roots for `stalk_added`. Must run before the stalk itself is
    /// added to the totals, so the pre-deposit ratio applies.
    pub fn mint_roots(
        &self,
        global: &mut GlobalState,
        account: &mut StalkBalance,
        stalk_added: u128,
    ) -> Result<u128, LedgerError> {
        let roots = self.roots_for_stalk(stalk_added, global.total_stalk, global.total_roots)?;
        let total_roots = global
            .total_roots
            .checked_add(roots)
            .ok_or(LedgerError::Overflow("total roots"))?;
        account.roots += roots;
        global.total_roots = total_roots;
        Ok(roots)
    }

    /// Debits roots for `stalk_removed`. Must run before the stalk itself is
    /// removed from the account.
    pub fn burn_roots(
        &self,
        global: &mut GlobalState,
        account: &mut StalkBalance,
        stalk_removed: u128,
    ) -> Result<u128, LedgerError> {
        let roots = self.roots_to_burn(stalk_removed, account.stalk, account.roots)?;
        if global.total_roots < roots {
            return Err(LedgerError::InvariantViolation(format!(
                "burning {roots} roots exceeds total roots {}",
                global.total_roots
            )));
        }
        account.roots -= roots;
        global.total_roots -= roots;
        Ok(roots)
    }

    /// Totals after `stalk_minted` of supply growth, or `None` when the
    /// growth is dropped. Nothing is written.
    fn grown_totals(
        &self,
        global: &GlobalState,
        stalk_minted: u128,
    ) -> Result<Option<(u128, u128, u128)>, LedgerError> {
        if stalk_minted == 0 || global.total_roots == 0 {
            return Ok(None);
        }
        let total_stalk = global
            .total_stalk
            .checked_add(stalk_minted)
            .ok_or(LedgerError::AmountTooLarge("supply growth"))?;
        let reward_pool = global
            .reward_pool
            .checked_add(stalk_minted)
            .ok_or(LedgerError::AmountTooLarge("supply growth"))?;
        let reward_per_root = mul_div_floor(stalk_minted, REWARD_INDEX_SCALE, global.total_roots)
            .and_then(|step| global.reward_per_root.checked_add(step))
            .ok_or(LedgerError::AmountTooLarge("reward index"))?;
        Ok(Some((total_stalk, reward_pool, reward_per_root)))
    }

    pub fn check_supply_growth(
        &self,
        global: &GlobalState,
        stalk_minted: u128,
    ) -> Result<(), LedgerError> {
        self.grown_totals(global, stalk_minted).map(drop)
    }

    /// Grows total stalk without minting roots. Returns the stalk actually
    /// added: growth is dropped while nobody holds roots, since there is no
    /// one it could belong to.
    pub fn on_supply_growth(
        &self,
        global: &mut GlobalState,
        stalk_minted: u128,
    ) -> Result<u128, LedgerError> {
        let Some((total_stalk, reward_pool, reward_per_root)) =
            self.grown_totals(global, stalk_minted)?
        else {
            return Ok(0);
        };
        global.total_stalk = total_stalk;
        global.reward_pool = reward_pool;
        global.reward_per_root = reward_per_root;
        Ok(stalk_minted)
    }

    /// Supply-growth stalk owed to `roots` held while the index moved from
    /// `from` to `to`, rounded down.
    pub fn rewards_for(&self, roots: u128, from: u128, to: u128) -> u128 {
        // roots * (to - from) / scale never exceeds the growth behind it.
        mul_div_floor(roots, to.saturating_sub(from), REWARD_INDEX_SCALE).unwrap_or(u128::MAX)
    }
}

/// `floor(a * b / c)` with a 256-bit intermediate. `None` on a zero divisor
/// or a quotient wider than 128 bits.
pub fn mul_div_floor(a: u128, b: u128, c: u128) -> Option<u128> {
    let (hi, lo) = widening_mul(a, b);
    div_rem_wide(hi, lo, c).map(|(q, _)| q)
}

/// `ceil(a * b / c)` with a 256-bit intermediate.
pub fn mul_div_ceil(a: u128, b: u128, c: u128) -> Option<u128> {
    let (hi, lo) = widening_mul(a, b);
    let (q, r) = div_rem_wide(hi, lo, c)?;
    if r == 0 {
        Some(q)
    } else {
        q.checked_add(1)
    }
}

fn widening_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = u64::MAX as u128;
    let (a_lo, a_hi) = (a & MASK, a >> 64);
    let (b_lo, b_hi) = (b & MASK, b >> 64);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let (mid, mid_carry) = lh.overflowing_add(hl);
    let (lo, lo_carry) = ll.overflowing_add(mid << 64);
    let hi = hh
        .wrapping_add(mid >> 64)
        .wrapping_add(if mid_carry { 1u128 << 64 } else { 0 })
        .wrapping_add(u128::from(lo_carry));
    (hi, lo)
}

/// Binary long division of the 256-bit value `(hi, lo)` by `divisor`.
fn div_rem_wide(hi: u128, lo: u128, divisor: u128) -> Option<(u128, u128)> {
    if divisor == 0 || hi >= divisor {
        return None;
    }
    if hi == 0 {
        return Some((lo / divisor, lo % divisor));
    }
    let mut rem = hi;
    let mut quot = 0u128;
    for bit in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> bit) & 1);
        quot <<= 1;
        // rem < divisor held before the shift, so one subtraction suffices.
        if carry == 1 || rem >= divisor {
            rem = rem.wrapping_sub(divisor);
            quot |= 1;
        }
    }
    Some((quot, rem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_handles_products_wider_than_128_bits() {
        let a = u128::MAX / 3;
        assert_eq!(mul_div_floor(a, 6, 3), Some(a * 2));
        assert_eq!(mul_div_floor(u128::MAX, u128::MAX, u128::MAX), Some(u128::MAX));
        assert_eq!(mul_div_floor(1 << 100, 1 << 100, 1 << 90), Some(1 << 110));
        assert_eq!(mul_div_floor(u128::MAX, 2, 1), None);
        assert_eq!(mul_div_floor(1, 1, 0), None);
    }

    #[test]
    fn rounding_direction_is_explicit() {
        assert_eq!(mul_div_floor(10, 1, 3), Some(3));
        assert_eq!(mul_div_ceil(10, 1, 3), Some(4));
        assert_eq!(mul_div_ceil(9, 1, 3), Some(3));
        let big = 1u128 << 120;
        assert_eq!(mul_div_floor(big + 1, big, big), Some(big + 1));
        assert_eq!(mul_div_ceil(big + 1, 3, 2), Some(((big + 1) * 3 + 1) / 2));
    }

    #[test]
    fn mint_floors_against_the_depositor() {
        let engine = RootsEngine::default();
        // 1 stalk at a 3:2 roots/stalk ratio is worth 1.5 roots.
        assert_eq!(engine.roots_for_stalk(1, 2, 3).unwrap(), 1);
    }

    #[test]
    fn burn_ceils_against_the_withdrawer() {
        let engine = RootsEngine::default();
        // 1 of 3 stalk backed by 10 roots is 3.33 roots.
        assert_eq!(engine.roots_to_burn(1, 3, 10).unwrap(), 4);
        assert_eq!(engine.roots_to_burn(3, 3, 10).unwrap(), 10);
        assert_eq!(engine.roots_to_burn(0, 3, 10).unwrap(), 0);
    }

    #[test]
    fn repeated_small_burns_never_beat_one_large_burn() {
        let engine = RootsEngine::default();
        let (mut stalk, mut roots) = (1_000u128, 333u128);
        let mut burned = 0;
        for _ in 0..10 {
            let r = engine.roots_to_burn(7, stalk, roots).unwrap();
            stalk -= 7;
            roots -= r;
            burned += r;
        }
        assert!(burned >= engine.roots_to_burn(70, 1_000, 333).unwrap());
    }

    #[test]
    fn bootstrap_mints_at_configured_ratio() {
        let engine = RootsEngine::new(1_000);
        assert_eq!(engine.roots_for_stalk(5, 0, 0).unwrap(), 5_000);
        assert_eq!(RootsEngine::default().roots_for_stalk(5, 0, 0).unwrap(), 5);
    }

    #[test]
    fn supply_growth_rebases_without_minting() {
        let engine = RootsEngine::default();
        let mut global = GlobalState {
            total_stalk: 100,
            total_roots: 100,
            ..GlobalState::default()
        };
        assert_eq!(engine.on_supply_growth(&mut global, 50).unwrap(), 50);
        assert_eq!(global.total_roots, 100);
        assert_eq!(global.total_stalk, 150);
        assert_eq!(global.reward_per_root, REWARD_INDEX_SCALE / 2);
        assert_eq!(engine.rewards_for(40, 0, global.reward_per_root), 20);
    }

    #[test]
    fn oversized_supply_growth_is_rejected_untouched() {
        let engine = RootsEngine::default();
        let mut global = GlobalState {
            total_stalk: 100,
            total_roots: 1,
            ..GlobalState::default()
        };
        let before = global.clone();
        assert_eq!(
            engine.on_supply_growth(&mut global, u128::MAX),
            Err(LedgerError::AmountTooLarge("supply growth"))
        );
        // Fits the totals but not the index at one root outstanding.
        assert_eq!(
            engine.on_supply_growth(&mut global, u128::MAX / 1_000),
            Err(LedgerError::AmountTooLarge("reward index"))
        );
        assert_eq!(global, before);
    }

    #[test]
    fn supply_growth_without_holders_is_dropped() {
        let engine = RootsEngine::default();
        let mut global = GlobalState::default();
        assert_eq!(engine.on_supply_growth(&mut global, 50).unwrap(), 0);
        assert_eq!(global.total_stalk, 0);
    }
}
