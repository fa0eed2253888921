//! Grid configuration and instrument precision

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Tolerance, in steps, absorbed before rounding to a tick or lot
const STEP_EPSILON: f64 = 1e-7;

/// Tick and lot sizes of one instrument, fetched from the exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentPrecision {
    /// Minimum price increment
    pub tick_size: f64,
    /// Minimum quantity increment
    pub lot_size: f64,
}

impl InstrumentPrecision {
    pub fn new(tick_size: f64, lot_size: f64) -> Self {
        Self {
            tick_size,
            lot_size,
        }
    }

    pub fn validate(&self) -> GridResult<()> {
        if !(self.tick_size > 0.0 && self.tick_size.is_finite()) {
            return Err(GridError::InvalidConfig(format!(
                "tick_size must be positive, got {}",
                self.tick_size
            )));
        }
        if !(self.lot_size > 0.0 && self.lot_size.is_finite()) {
            return Err(GridError::InvalidConfig(format!(
                "lot_size must be positive, got {}",
                self.lot_size
            )));
        }
        Ok(())
    }

    /// Round a price onto the tick grid
    ///
    /// Sell levels round up and buy levels round down, so a level can never
    /// move toward (or across) the center.
    pub fn round_price(&self, price: f64, round_up: bool) -> f64 {
        snap(price, self.tick_size, round_up)
    }

    /// Round a size down to the lot grid
    pub fn round_size(&self, size: f64) -> f64 {
        snap(size, self.lot_size, false)
    }

    /// Whether two prices land on the same tick
    pub fn same_price(&self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.tick_size / 2.0
    }
}

impl Default for InstrumentPrecision {
    fn default() -> Self {
        Self::new(0.01, 0.001)
    }
}

fn snap(value: f64, step: f64, round_up: bool) -> f64 {
    let steps = value / step;
    let whole = if round_up {
        (steps - STEP_EPSILON).ceil()
    } else {
        (steps + STEP_EPSILON).floor()
    };
    let factor = 10f64.powi(step_decimals(step));
    (whole * step * factor).round() / factor
}

/// Decimal places needed to write `step` exactly
fn step_decimals(step: f64) -> i32 {
    (0..=12)
        .find(|&d| {
            let scaled = step * 10f64.powi(d);
            (scaled - scaled.round()).abs() < 1e-9
        })
        .unwrap_or(12)
}

/// Grid configuration for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Symbol to trade (e.g., "BTC/USDT")
    pub symbol: String,

    /// Fixed price distance between adjacent levels
    pub spacing: f64,

    /// Quote-currency value of every order
    /// The order size per level is calculated as:
    /// quantity = order_value / level_price
    pub order_value: f64,

    /// Number of levels on each side of the center
    pub grid_levels: u32,

    /// Leverage applied to the symbol before seeding
    pub leverage: u32,
}

impl GridConfig {
    pub fn new(
        symbol: impl Into<String>,
        spacing: f64,
        order_value: f64,
        grid_levels: u32,
        leverage: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            spacing,
            order_value,
            grid_levels,
            leverage,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if !(self.spacing > 0.0 && self.spacing.is_finite()) {
            return Err(GridError::InvalidConfig(format!(
                "{}: spacing must be positive, got {}",
                self.symbol, self.spacing
            )));
        }

        if !(self.order_value > 0.0 && self.order_value.is_finite()) {
            return Err(GridError::InvalidConfig(format!(
                "{}: order_value must be positive, got {}",
                self.symbol, self.order_value
            )));
        }

        if self.grid_levels == 0 {
            return Err(GridError::InvalidConfig(format!(
                "{}: grid_levels must be at least 1",
                self.symbol
            )));
        }

        if self.leverage == 0 {
            return Err(GridError::InvalidConfig(format!(
                "{}: leverage must be at least 1",
                self.symbol
            )));
        }

        Ok(())
    }

    /// Validate against the instrument's precision
    pub fn validate_precision(&self, precision: &InstrumentPrecision) -> GridResult<()> {
        precision.validate()?;
        if self.spacing + STEP_EPSILON < precision.tick_size {
            return Err(GridError::InvalidConfig(format!(
                "{}: spacing {} is smaller than tick size {}",
                self.symbol, self.spacing, precision.tick_size
            )));
        }
        Ok(())
    }

    /// Total number of slots in the ladder
    pub fn num_slots(&self) -> usize {
        2 * self.grid_levels as usize
    }

    /// Calculate order size for a specific price level
    ///
    /// Each level commits the same quote amount, so lower levels buy more
    /// contracts than higher ones.
    pub fn order_size_at_price(&self, price: f64, precision: &InstrumentPrecision) -> f64 {
        precision.round_size(self.order_value / price)
    }
}

/// Engine-wide settings shared by every symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Seconds between health checks
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Minimum fraction of confirmed slots before a reset
    #[serde(default = "default_completeness_threshold")]
    pub completeness_threshold: f64,

    /// Maximum normalized gap deviation before a reset
    #[serde(default = "default_uniformity_threshold")]
    pub uniformity_threshold: f64,

    /// Seconds between summary log lines
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Maximum attempts for a place or cancel batch
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Time engines get to cancel their orders after the stop signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Base delay before the dispatcher resubscribes a dead fill stream
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_base_delay_ms: u64,
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_completeness_threshold() -> f64 {
    0.8
}

fn default_uniformity_threshold() -> f64 {
    0.5
}

fn default_report_interval() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_resubscribe_delay() -> u64 {
    500
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            completeness_threshold: default_completeness_threshold(),
            uniformity_threshold: default_uniformity_threshold(),
            report_interval_secs: default_report_interval(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            shutdown_grace_secs: default_shutdown_grace(),
            resubscribe_base_delay_ms: default_resubscribe_delay(),
        }
    }
}

impl EngineSettings {
    /// Validate the settings
    pub fn validate(&self) -> GridResult<()> {
        if self.health_check_interval_secs == 0 || self.report_interval_secs == 0 {
            return Err(GridError::InvalidConfig(
                "health check and report intervals must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.completeness_threshold) {
            return Err(GridError::InvalidConfig(
                "completeness_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if !(self.uniformity_threshold >= 0.0) {
            return Err(GridError::InvalidConfig(
                "uniformity_threshold must be non-negative".into(),
            ));
        }
        if self.max_order_retries == 0 {
            return Err(GridError::InvalidConfig(
                "max_order_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, 2, 20);
        assert!(config.validate().is_ok());

        let config = GridConfig::new("", 100.0, 20.0, 2, 20);
        assert!(config.validate().is_err());

        let config = GridConfig::new("BTC/USDT", 0.0, 20.0, 2, 20);
        assert!(config.validate().is_err());

        let config = GridConfig::new("BTC/USDT", 100.0, -1.0, 2, 20);
        assert!(config.validate().is_err());

        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, 0, 20);
        assert!(config.validate().is_err());

        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, 2, 0);
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_spacing_below_tick_rejected() {
        let config = GridConfig::new("BTC/USDT", 0.05, 20.0, 2, 20);
        let precision = InstrumentPrecision::new(0.1, 0.001);
        assert!(config.validate_precision(&precision).is_err());

        let config = GridConfig::new("BTC/USDT", 0.1, 20.0, 2, 20);
        assert!(config.validate_precision(&precision).is_ok());
    }

    #[test]
    fn test_price_rounding_direction() {
        let precision = InstrumentPrecision::new(0.5, 0.001);
        assert_eq!(precision.round_price(100.2, true), 100.5);
        assert_eq!(precision.round_price(100.2, false), 100.0);
        // Exact ticks stay put in both directions
        assert_eq!(precision.round_price(100.5, true), 100.5);
        assert_eq!(precision.round_price(100.5, false), 100.5);
    }

    #[test]
    fn test_rounding_absorbs_float_noise() {
        let precision = InstrumentPrecision::new(0.1, 0.001);
        let noisy = 0.1 + 0.2; // 0.30000000000000004
        assert_eq!(precision.round_price(noisy, true), 0.3);
        assert_eq!(precision.round_price(50000.0 + 3.0 * 33.3, true), 50099.9);
    }

    #[test]
    fn test_order_size_at_price() {
        let config = GridConfig::new("BTC/USDT", 100.0, 20.0, 2, 20);
        let precision = InstrumentPrecision::new(0.1, 0.0001);

        // 20 / 50100 = 0.000399.. floors to 0.0003
        let size = config.order_size_at_price(50100.0, &precision);
        assert!((size - 0.0003).abs() < 1e-12);

        // 20 / 40000 = 0.0005 exactly
        let size = config.order_size_at_price(40000.0, &precision);
        assert!((size - 0.0005).abs() < 1e-12);

        // Lot too coarse: rounds to zero
        let coarse = InstrumentPrecision::new(0.1, 0.001);
        assert_eq!(config.order_size_at_price(50100.0, &coarse), 0.0);
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.health_check_interval_secs, 60);
        assert_eq!(settings.max_order_retries, 3);

        let parsed: EngineSettings =
            serde_json::from_str(r#"{"completeness_threshold": 0.9}"#).unwrap();
        assert_eq!(parsed.completeness_threshold, 0.9);
        assert_eq!(parsed.uniformity_threshold, 0.5);

        let bad = EngineSettings {
            completeness_threshold: 1.5,
            ..EngineSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
