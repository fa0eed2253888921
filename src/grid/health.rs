//! Grid health metrics - compares local ladder against an exchange snapshot

use std::collections::HashMap;

use super::config::InstrumentPrecision;
use super::state::GridState;
use super::types::{Oid, OpenOrder};

/// Thresholds that decide whether a ladder needs a full reset
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Reset when completeness falls below this
    pub completeness: f64,
    /// Reset when uniformity rises above this
    pub uniformity: f64,
}

/// Outcome of evaluating one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Confirmed resting slots / total slots
    pub completeness: f64,
    /// Max |gap - expected| / spacing between neighbouring confirmed orders
    pub uniformity: f64,
    /// Local levels whose oid is absent from the snapshot
    pub missing: Vec<i32>,
    /// Snapshot orders the engine has no record of
    pub unknown: Vec<Oid>,
    /// Known oids whose price or side disagrees with the local level
    pub mismatched: Vec<Oid>,
}

impl HealthReport {
    /// Whether the exchange holds orders the engine cannot account for
    pub fn is_stale(&self) -> bool {
        !self.unknown.is_empty() || !self.mismatched.is_empty()
    }

    /// Whether the ladder has drifted past the thresholds
    pub fn breaches(&self, thresholds: &HealthThresholds) -> bool {
        self.completeness < thresholds.completeness || self.uniformity > thresholds.uniformity
    }

    /// Whether the engine must tear the ladder down
    pub fn needs_reset(&self, thresholds: &HealthThresholds) -> bool {
        self.is_stale() || self.breaches(thresholds)
    }
}

/// Evaluate `state` against a fresh open-orders snapshot
pub fn evaluate(
    state: &GridState,
    snapshot: &[OpenOrder],
    spacing: f64,
    precision: &InstrumentPrecision,
) -> HealthReport {
    let live: HashMap<Oid, &OpenOrder> = snapshot.iter().map(|o| (o.oid, o)).collect();

    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    // Every slot in price order, flagged when its order is confirmed live
    let mut ladder: Vec<(f64, bool)> = Vec::with_capacity(state.num_slots());

    for level in state.levels() {
        let confirmed = match level.oid {
            None => false,
            Some(oid) => match live.get(&oid) {
                Some(order)
                    if order.side == level.side
                        && precision.same_price(order.price, level.price) =>
                {
                    true
                }
                Some(_) => {
                    mismatched.push(oid);
                    false
                }
                None => {
                    missing.push(level.index);
                    false
                }
            },
        };
        ladder.push((level.price, confirmed));
    }
    let confirmed = ladder.iter().filter(|(_, live)| *live).count();

    let unknown: Vec<Oid> = snapshot
        .iter()
        .filter(|o| state.find_index_by_oid(o.oid).is_none())
        .map(|o| o.oid)
        .collect();

    let slots = state.num_slots();
    let completeness = if slots == 0 {
        0.0
    } else {
        confirmed as f64 / slots as f64
    };

    HealthReport {
        completeness,
        uniformity: uniformity(&ladder, spacing),
        missing,
        unknown,
        mismatched,
    }
}

/// Worst normalized deviation of the gaps between confirmed orders
///
/// Each gap is measured against the gap from the lower order's level to the
/// next level of the ladder. Level prices are already tick-rounded, so an
/// intact ladder scores zero whatever the spacing, and every vacant level
/// between two confirmed orders adds roughly one spacing.
fn uniformity(ladder: &[(f64, bool)], spacing: f64) -> f64 {
    let confirmed: Vec<usize> = ladder
        .iter()
        .enumerate()
        .filter(|(_, (_, live))| *live)
        .map(|(pos, _)| pos)
        .collect();

    confirmed
        .windows(2)
        .map(|pair| {
            let (low, high) = (pair[0], pair[1]);
            let expected = ladder[low + 1].0 - ladder[low].0;
            let actual = ladder[high].0 - ladder[low].0;
            (actual - expected).abs() / spacing
        })
        .fold(0.0, f64::max)
}
