//! Core data types for grid maintenance

use serde::{Deserialize, Serialize};

/// Exchange order identifier
pub type Oid = u64;

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Side owning a signed level index (negative = buy, positive = sell)
    pub fn for_index(index: i32) -> Self {
        if index < 0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Collateral mode of a perp position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// Whether a symbol keeps one net position or separate long and short legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Created, no orders placed yet
    Idle,
    /// Placing the initial ladder
    Seeding,
    /// Normal grid maintenance
    Running,
    /// Tearing the ladder down and rebuilding it
    Resetting,
    /// Final cancel-all in progress
    Draining,
    /// No orders left, worker finished
    Stopped,
}

impl EngineStatus {
    /// Whether the engine may still send new orders
    pub fn can_place(&self) -> bool {
        matches!(
            self,
            EngineStatus::Seeding | EngineStatus::Running | EngineStatus::Resetting
        )
    }
}

/// One rung of the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Signed offset from center (negative = buy side, positive = sell side)
    pub index: i32,
    /// Price at this level, already rounded to the instrument tick
    pub price: f64,
    pub side: OrderSide,
    /// Order size, already rounded to the instrument lot
    pub quantity: f64,
    /// Exchange order ID while an order rests at this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<Oid>,
}

impl GridLevel {
    /// Create a new vacant grid level
    pub fn new(index: i32, price: f64, quantity: f64) -> Self {
        Self {
            index,
            price,
            side: OrderSide::for_index(index),
            quantity,
            oid: None,
        }
    }

    /// Check if this level has a live order
    pub fn is_resting(&self) -> bool {
        self.oid.is_some()
    }

    /// Order request that would fill this slot
    pub fn order_request(&self) -> OrderRequest {
        OrderRequest::new(self.index, self.side, self.price, self.quantity)
    }
}

/// Request to place one limit order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Level index this order belongs to
    pub level_index: i32,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
}

impl OrderRequest {
    pub fn new(level_index: i32, side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            level_index,
            side,
            price,
            quantity,
        }
    }
}

/// Fill notification from the exchange; each event is a fully filled order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: String,
    pub oid: Oid,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Exchange timestamp in milliseconds
    pub timestamp: u64,
}

/// Entry of an open-orders snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub oid: Oid,
    pub price: f64,
    pub side: OrderSide,
}

/// Running fill statistics for one symbol, carried across resets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridStats {
    pub num_fills: u32,
    pub num_buys: u32,
    pub num_sells: u32,
    /// Completed buy/sell pairs
    pub num_round_trips: u32,
    /// Sum of price * quantity over all fills
    pub total_notional: f64,
    /// Round trips times spacing times quantity, before fees
    pub estimated_grid_profit: f64,
    pub num_resets: u32,
    open_longs: u32,
    open_shorts: u32,
}

impl GridStats {
    /// Record a fill, pairing it against an opposite open leg when possible
    pub fn record_fill(&mut self, fill: &FillEvent, spacing: f64) {
        self.num_fills += 1;
        self.total_notional += fill.price * fill.quantity;

        let closes_pair = match fill.side {
            OrderSide::Buy => {
                self.num_buys += 1;
                if self.open_shorts > 0 {
                    self.open_shorts -= 1;
                    true
                } else {
                    self.open_longs += 1;
                    false
                }
            }
            OrderSide::Sell => {
                self.num_sells += 1;
                if self.open_longs > 0 {
                    self.open_longs -= 1;
                    true
                } else {
                    self.open_shorts += 1;
                    false
                }
            }
        };

        if closes_pair {
            self.num_round_trips += 1;
            self.estimated_grid_profit += spacing * fill.quantity;
        }
    }

    pub fn record_reset(&mut self) {
        self.num_resets += 1;
    }

    /// Net filled legs still waiting for their pair (positive = long)
    pub fn open_legs(&self) -> i64 {
        self.open_longs as i64 - self.open_shorts as i64
    }
}
