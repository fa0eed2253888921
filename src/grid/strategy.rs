//! Grid strategy - ladder computation around a center price

use super::config::{GridConfig, InstrumentPrecision};
use super::errors::{GridError, GridResult};
use super::types::GridLevel;

/// Computes ladders for one symbol
#[derive(Debug, Clone)]
pub struct GridStrategy {
    config: GridConfig,
    precision: InstrumentPrecision,
}

impl GridStrategy {
    /// Create a strategy, validating the config against the instrument
    pub fn new(config: GridConfig, precision: InstrumentPrecision) -> GridResult<Self> {
        config.validate()?;
        config.validate_precision(&precision)?;
        Ok(Self { config, precision })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn precision(&self) -> &InstrumentPrecision {
        &self.precision
    }

    /// Build the full ladder around `center`, ordered from lowest to highest price
    ///
    /// Fails with [`GridError::QuantityTooSmall`] as soon as any level would
    /// carry a zero quantity after lot rounding.
    pub fn build_initial_levels(&self, center: f64) -> GridResult<Vec<GridLevel>> {
        if !(center > 0.0 && center.is_finite()) {
            return Err(GridError::InvalidConfig(format!(
                "{}: center price must be positive, got {}",
                self.config.symbol, center
            )));
        }

        let n = self.config.grid_levels as i32;
        let mut levels = Vec::with_capacity(self.config.num_slots());

        for index in (-n..=n).filter(|&i| i != 0) {
            let price = self.level_price(center, index);
            if price <= 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "{}: level {} falls to non-positive price {} around center {}",
                    self.config.symbol, index, price, center
                )));
            }

            let quantity = self.config.order_size_at_price(price, &self.precision);
            if quantity <= 0.0 {
                return Err(GridError::QuantityTooSmall { index, price });
            }

            levels.push(GridLevel::new(index, price, quantity));
        }

        Ok(levels)
    }

    /// Rounded price of `index` around `center`
    pub fn level_price(&self, center: f64, index: i32) -> f64 {
        let raw = center + index as f64 * self.config.spacing;
        // Sells round up, buys round down
        self.precision.round_price(raw, index > 0)
    }

    /// Center of the ladder after the level at `index` filled
    pub fn re_anchored_center(&self, center: f64, index: i32) -> f64 {
        center + index as f64 * self.config.spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::OrderSide;

    fn btc_strategy(grid_levels: u32) -> GridStrategy {
        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, grid_levels, 20);
        GridStrategy::new(config, InstrumentPrecision::new(0.1, 0.0001)).unwrap()
    }

    #[test]
    fn test_example_ladder() {
        let strategy = btc_strategy(2);
        let levels = strategy.build_initial_levels(50000.0).unwrap();

        let prices: Vec<(f64, OrderSide)> = levels.iter().map(|l| (l.price, l.side)).collect();
        assert_eq!(
            prices,
            vec![
                (49800.0, OrderSide::Buy),
                (49900.0, OrderSide::Buy),
                (50100.0, OrderSide::Sell),
                (50200.0, OrderSide::Sell),
            ]
        );
        assert!(levels.iter().all(|l| l.oid.is_none() && l.quantity > 0.0));
    }

    #[test]
    fn test_ladder_properties() {
        for grid_levels in 1..=8 {
            for &center in &[97.35, 1234.56, 50000.0, 64321.07] {
                let config = GridConfig::new("X", 0.7, 500.0, grid_levels, 5);
                let strategy =
                    GridStrategy::new(config, InstrumentPrecision::new(0.1, 0.001)).unwrap();
                let levels = strategy.build_initial_levels(center).unwrap();

                assert_eq!(levels.len(), 2 * grid_levels as usize);
                for level in &levels {
                    match level.side {
                        OrderSide::Sell => assert!(level.price > center),
                        OrderSide::Buy => assert!(level.price < center),
                    }
                }

                // Strictly increasing prices means all distinct
                for pair in levels.windows(2) {
                    assert!(pair[0].price < pair[1].price);
                }

                // Same-side neighbours are one spacing apart, up to a tick
                for pair in levels.windows(2) {
                    if pair[0].side == pair[1].side {
                        let gap = pair[1].price - pair[0].price;
                        assert!((gap - 0.7).abs() <= 0.1 + 1e-9, "gap {}", gap);
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_quantity_fails_fast() {
        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, 2, 20);
        let strategy = GridStrategy::new(config, InstrumentPrecision::new(0.1, 0.001)).unwrap();

        match strategy.build_initial_levels(50000.0) {
            Err(GridError::QuantityTooSmall { index, .. }) => assert_eq!(index, -2),
            other => panic!("expected QuantityTooSmall, got {:?}", other),
        }
    }

    #[test]
    fn test_ladder_below_zero_rejected() {
        let strategy = btc_strategy(3);
        assert!(strategy.build_initial_levels(250.0).is_err());
        assert!(strategy.build_initial_levels(0.0).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GridConfig::new("BTC/USDT", 0.01, 20.0, 2, 20);
        assert!(GridStrategy::new(config, InstrumentPrecision::new(0.1, 0.0001)).is_err());
    }

    #[test]
    fn test_re_anchored_center() {
        let strategy = btc_strategy(2);
        assert_eq!(strategy.re_anchored_center(50000.0, 1), 50100.0);
        assert_eq!(strategy.re_anchored_center(50000.0, -2), 49800.0);
    }
}
