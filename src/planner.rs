//! Charge and balance decisions.
//!
//! Each Active tick the planner looks at the latest snapshot and decides
//! whether the charger relay should close and which cells should drain.
//! The decision is a pure function of the snapshot and configuration;
//! applying it to hardware is left to the controller.

use crate::constants::*;
use crate::error::Result;
use crate::hardware::IoExpander;
use crate::types::{Config, DrainPlan, PackSnapshot};
use std::cmp::Ordering;

/// Where the balancer pulls the pack towards
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceTarget {
    /// Spread exceeds `dv`: pull everything down to just above the lowest cell
    LowestCell(f64),
    /// Pack is even but above target: pull down to the configured target
    Nominal(f64),
}

impl BalanceTarget {
    pub fn voltage(self) -> f64 {
        match self {
            BalanceTarget::LowestCell(v) | BalanceTarget::Nominal(v) => v,
        }
    }
}

/// Work the planner wants done during the next window
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    /// Close the charge relay
    pub charge: bool,
    /// Discharge target, present when balancing
    pub target: Option<BalanceTarget>,
    pub drain: DrainPlan,
}

/// Decision for one Active tick
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// Target voltage lies outside `[min_voltage, max_voltage]`
    Misconfigured,
    /// Nothing to charge and nothing to balance
    Settled,
    Working(Balance),
}

impl PlanOutcome {
    /// Drain plan to apply; empty unless work is pending
    pub fn drain(&self) -> DrainPlan {
        match self {
            PlanOutcome::Working(balance) => balance.drain,
            _ => DrainPlan::cleared(),
        }
    }
}

/// Decide charging and balancing for the given snapshot
pub fn plan(snapshot: &PackSnapshot, config: &Config) -> PlanOutcome {
    if !config.target_in_band() {
        return PlanOutcome::Misconfigured;
    }

    let charge = (snapshot.min_voltage < config.min_voltage
        || snapshot.mean_voltage < config.target_voltage - config.dv / 2.0)
        && snapshot.max_voltage < config.max_voltage - CHARGE_HEADROOM;

    let needs_balance = (snapshot.spread() > config.dv
        || snapshot.mean_voltage > config.target_voltage + config.dv / 2.0)
        && snapshot.min_voltage > config.min_voltage;

    let target = needs_balance.then(|| {
        if snapshot.spread() > config.dv {
            BalanceTarget::LowestCell(snapshot.min_voltage + config.dv / 2.0)
        } else {
            BalanceTarget::Nominal(config.target_voltage)
        }
    });

    if !charge && target.is_none() {
        return PlanOutcome::Settled;
    }

    let drain = match target {
        Some(target) => select_cells(&snapshot.cells, target.voltage(), MAX_CONCURRENT_DRAINS),
        None => DrainPlan::cleared(),
    };

    PlanOutcome::Working(Balance {
        charge,
        target,
        drain,
    })
}

/// Pick up to `limit` cells strictly above `target`, highest first
///
/// Equal voltages keep their cell order.
pub fn select_cells(cells: &[f64], target: f64, limit: usize) -> DrainPlan {
    let mut candidates: Vec<usize> = (0..cells.len()).filter(|&i| cells[i] > target).collect();
    candidates.sort_by(|&a, &b| cells[b].partial_cmp(&cells[a]).unwrap_or(Ordering::Equal));

    let mut plan = DrainPlan::cleared();
    for &cell in candidates.iter().take(limit.min(MAX_CONCURRENT_DRAINS)) {
        plan.drain(cell);
    }
    plan
}

/// Write a drain plan to the expander banks, eight slots per bank
pub fn push_plan(plan: &DrainPlan, expanders: &mut [Box<dyn IoExpander>]) -> Result<()> {
    for (expander, byte) in expanders.iter_mut().zip(plan.bank_bytes()) {
        expander.write_outputs(byte)?;
    }
    Ok(())
}

/// Progress of the "balance settled" confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStep {
    /// Still confirming; holds the confirmation number just taken
    Confirming(u8),
    /// Confirmed enough times in a row
    Complete,
}

/// Counts consecutive settled ticks before a cycle is declared complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleTracker {
    confirmations: u8,
}

impl SettleTracker {
    /// Record a settled tick
    pub fn observe(&mut self) -> SettleStep {
        if self.confirmations < SETTLE_CONFIRMATIONS {
            let taken = self.confirmations;
            self.confirmations += 1;
            SettleStep::Confirming(taken)
        } else {
            self.confirmations = 0;
            SettleStep::Complete
        }
    }

    pub fn reset(&mut self) {
        self.confirmations = 0;
    }

    pub fn confirmations(&self) -> u8 {
        self.confirmations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExpander;
    use crate::telemetry::summarize;

    fn snapshot(cells: [f64; CELL_COUNT]) -> PackSnapshot {
        summarize(cells)
    }

    #[test]
    fn test_misconfigured_target_yields_empty_plan() {
        let snap = snapshot([4.0; CELL_COUNT]);
        for target in [3.0, 3.39, 4.26, 5.0] {
            let config = Config {
                target_voltage: target,
                ..Config::default()
            };
            let outcome = plan(&snap, &config);
            assert_eq!(outcome, PlanOutcome::Misconfigured);
            assert_eq!(outcome.drain().active_count(), 0);
        }
    }

    #[test]
    fn test_high_cells_drain_first_and_low_cell_is_spared() {
        let mut cells = [4.20; CELL_COUNT];
        cells[CELL_COUNT - 1] = 3.50;
        let config = Config {
            dv: 0.01,
            target_voltage: 3.85,
            ..Config::default()
        };

        let outcome = plan(&snapshot(cells), &config);
        let balance = match outcome {
            PlanOutcome::Working(balance) => balance,
            other => panic!("expected balancing, got {:?}", other),
        };
        assert!(!balance.charge);
        assert!(matches!(balance.target, Some(BalanceTarget::LowestCell(_))));
        assert_eq!(balance.drain.active_count(), MAX_CONCURRENT_DRAINS);
        assert!(!balance.drain.is_draining(CELL_COUNT - 1));
        assert_eq!(balance.drain.draining_cells(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_selection_prefers_highest_voltage() {
        let mut cells = [3.90; CELL_COUNT];
        for (i, cell) in cells.iter_mut().enumerate().take(12) {
            *cell = 4.00 + i as f64 * 0.001;
        }
        let plan = select_cells(&cells, 3.95, MAX_CONCURRENT_DRAINS);
        assert_eq!(plan.draining_cells(), (2..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_cap_holds_for_any_distribution() {
        let mut seed: u32 = 0x1234_5678;
        for _ in 0..200 {
            let mut cells = [0.0; CELL_COUNT];
            for cell in cells.iter_mut() {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                *cell = 3.45 + (seed >> 16) as f64 / 65536.0 * 0.75;
            }
            let outcome = plan(&snapshot(cells), &Config::default());
            assert!(outcome.drain().active_count() <= MAX_CONCURRENT_DRAINS);
            for slot in CELL_COUNT..DRAIN_CAPACITY {
                assert!(!outcome.drain().is_draining(slot));
            }
        }
        let plan = select_cells(&[4.2; CELL_COUNT], 3.0, 50);
        assert_eq!(plan.active_count(), MAX_CONCURRENT_DRAINS);
    }

    #[test]
    fn test_low_pack_charges_without_balancing() {
        let config = Config::default();
        let outcome = plan(&snapshot([3.6; CELL_COUNT]), &config);
        assert_eq!(
            outcome,
            PlanOutcome::Working(Balance {
                charge: true,
                target: None,
                drain: DrainPlan::cleared(),
            })
        );
    }

    #[test]
    fn test_charge_inhibited_near_ceiling() {
        let mut cells = [3.6; CELL_COUNT];
        cells[3] = 4.21;
        let outcome = plan(&snapshot(cells), &Config::default());
        let PlanOutcome::Working(balance) = outcome else {
            panic!("expected work");
        };
        assert!(!balance.charge);
        assert!(balance.drain.is_draining(3));
    }

    #[test]
    fn test_even_pack_above_target_pulls_to_nominal() {
        let config = Config::default();
        let outcome = plan(&snapshot([3.95; CELL_COUNT]), &config);
        let PlanOutcome::Working(balance) = outcome else {
            panic!("expected work");
        };
        assert_eq!(balance.target, Some(BalanceTarget::Nominal(3.85)));
        assert_eq!(balance.drain.active_count(), MAX_CONCURRENT_DRAINS);
    }

    #[test]
    fn test_pack_at_target_is_settled() {
        let outcome = plan(&snapshot([3.85; CELL_COUNT]), &Config::default());
        assert_eq!(outcome, PlanOutcome::Settled);
    }

    #[test]
    fn test_push_plan_packs_bits_per_bank() {
        let banks = [MockExpander::new(), MockExpander::new(), MockExpander::new()];
        let mut expanders: Vec<Box<dyn IoExpander>> = banks
            .iter()
            .map(|b| Box::new(b.clone()) as Box<dyn IoExpander>)
            .collect();

        let mut plan = DrainPlan::cleared();
        plan.drain(0);
        plan.drain(7);
        plan.drain(9);
        plan.drain(19);
        push_plan(&plan, &mut expanders).unwrap();

        assert_eq!(banks[0].outputs(), 0b1000_0001);
        assert_eq!(banks[1].outputs(), 0b0000_0010);
        assert_eq!(banks[2].outputs(), 0b0000_1000);
    }

    #[test]
    fn test_settle_tracker_needs_four_confirmations() {
        let mut tracker = SettleTracker::default();
        for n in 0..SETTLE_CONFIRMATIONS {
            assert_eq!(tracker.observe(), SettleStep::Confirming(n));
        }
        assert_eq!(tracker.observe(), SettleStep::Complete);
        assert_eq!(tracker.confirmations(), 0);

        tracker.observe();
        tracker.reset();
        assert_eq!(tracker.confirmations(), 0);
    }
}
