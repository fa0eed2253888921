//! Per-symbol grid state

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::InstrumentPrecision;
use super::errors::{GridError, GridResult};
use super::types::{GridLevel, GridStats, Oid, OrderRequest, OrderSide};

/// Ladder of one symbol, owned by exactly one engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    /// Reference price the ladder is built around
    pub center: f64,

    /// All levels keyed by signed index
    levels: BTreeMap<i32, GridLevel>,

    /// Mapping from oid to level index (for fast lookup on fills)
    #[serde(default)]
    oid_to_level: HashMap<Oid, i32>,

    /// When the last health check completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,

    /// Fill statistics
    pub stats: GridStats,
}

impl GridState {
    /// Create a state from freshly built, vacant levels
    pub fn new(center: f64, levels: Vec<GridLevel>) -> Self {
        let mut state = Self {
            center,
            levels: BTreeMap::new(),
            oid_to_level: HashMap::new(),
            last_health_check_at: None,
            stats: GridStats::default(),
        };
        for mut level in levels {
            level.oid = None;
            state.levels.insert(level.index, level);
        }
        state
    }

    /// Get a level by index
    pub fn level(&self, index: i32) -> Option<&GridLevel> {
        self.levels.get(&index)
    }

    /// All levels from lowest to highest price
    pub fn levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    pub fn num_slots(&self) -> usize {
        self.levels.len()
    }

    /// Find level index by oid
    pub fn find_index_by_oid(&self, oid: Oid) -> Option<i32> {
        self.oid_to_level.get(&oid).copied()
    }

    /// Record that an order now rests at `index`
    pub fn occupy(&mut self, index: i32, oid: Oid) -> GridResult<()> {
        let level = self.levels.get_mut(&index).ok_or_else(|| {
            GridError::StaleData(format!("no level {} to attach oid {}", index, oid))
        })?;
        if let Some(existing) = level.oid {
            return Err(GridError::StaleData(format!(
                "level {} already holds oid {}, refusing oid {}",
                index, existing, oid
            )));
        }
        level.oid = Some(oid);
        self.oid_to_level.insert(oid, index);
        Ok(())
    }

    /// Mark a level as having no live order, returning the order it held
    pub fn vacate(&mut self, index: i32) -> Option<Oid> {
        let oid = self.levels.get_mut(&index).and_then(|l| l.oid.take());
        if let Some(oid) = oid {
            self.oid_to_level.remove(&oid);
        }
        oid
    }

    /// Vacate every level, returning the orders they held
    pub fn vacate_all(&mut self) -> Vec<Oid> {
        let oids: Vec<Oid> = self.levels.values_mut().filter_map(|l| l.oid.take()).collect();
        self.oid_to_level.clear();
        oids
    }

    /// Oids of every resting level
    pub fn resting_oids(&self) -> Vec<Oid> {
        self.levels.values().filter_map(|l| l.oid).collect()
    }

    pub fn resting_count(&self) -> usize {
        self.oid_to_level.len()
    }

    /// Count resting orders on one side
    pub fn count_resting(&self, side: OrderSide) -> usize {
        self.levels
            .values()
            .filter(|l| l.is_resting() && l.side == side)
            .count()
    }

    /// Requests for every vacant slot, innermost first
    pub fn vacant_requests(&self) -> Vec<OrderRequest> {
        let mut requests: Vec<OrderRequest> = self
            .levels
            .values()
            .filter(|l| !l.is_resting())
            .map(GridLevel::order_request)
            .collect();
        requests.sort_by_key(|r| r.level_index.abs());
        requests
    }

    /// Move the ladder onto `center`, carrying over resting orders that still fit
    ///
    /// A resting order survives when the new ladder has a level with the same
    /// side at the same price. Every other resting order is returned so the
    /// caller can cancel it.
    pub fn re_anchor(
        &mut self,
        center: f64,
        new_levels: Vec<GridLevel>,
        precision: &InstrumentPrecision,
    ) -> Vec<Oid> {
        let mut incoming: BTreeMap<i32, GridLevel> = new_levels
            .into_iter()
            .map(|mut l| {
                l.oid = None;
                (l.index, l)
            })
            .collect();

        let mut orphaned = Vec::new();
        for old in self.levels.values() {
            let Some(oid) = old.oid else { continue };
            let slot = incoming.values_mut().find(|l| {
                l.oid.is_none() && l.side == old.side && precision.same_price(l.price, old.price)
            });
            match slot {
                Some(slot) => slot.oid = Some(oid),
                None => orphaned.push(oid),
            }
        }

        self.center = center;
        self.oid_to_level = incoming
            .values()
            .filter_map(|l| l.oid.map(|oid| (oid, l.index)))
            .collect();
        self.levels = incoming;
        orphaned
    }

    /// Verify the structural invariants of the ladder
    pub fn check_invariants(&self, grid_levels: u32) -> GridResult<()> {
        let buys = self.levels.keys().filter(|&&i| i < 0).count();
        let sells = self.levels.keys().filter(|&&i| i > 0).count();
        if buys != grid_levels as usize || sells != grid_levels as usize || self.levels.contains_key(&0) {
            return Err(GridError::StaleData(format!(
                "expected {} levels per side, found {} buys and {} sells",
                grid_levels, buys, sells
            )));
        }

        for (index, level) in &self.levels {
            if level.index != *index || level.side != OrderSide::for_index(*index) {
                return Err(GridError::StaleData(format!("level {} is mislabelled", index)));
            }
        }

        let prices: Vec<f64> = self.levels.values().map(|l| l.price).collect();
        if prices.windows(2).any(|p| p[0] >= p[1]) {
            return Err(GridError::StaleData("level prices are not strictly increasing".into()));
        }

        if self.oid_to_level.len() != self.levels.values().filter(|l| l.is_resting()).count() {
            return Err(GridError::StaleData("oid index out of sync with levels".into()));
        }
        for (oid, index) in &self.oid_to_level {
            if self.levels.get(index).and_then(|l| l.oid) != Some(*oid) {
                return Err(GridError::StaleData(format!(
                    "oid {} indexed at level {} but not held there",
                    oid, index
                )));
            }
        }

        Ok(())
    }

    /// Update timestamp of the last health check
    pub fn touch_health_check(&mut self) {
        self.last_health_check_at = Some(Utc::now());
    }
}
