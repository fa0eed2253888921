//! Grid Maintenance Engine for Perpetual Futures
//!
//! For every configured symbol an engine keeps a ladder of buy and sell limit
//! orders at a fixed spacing around a center price. Fills re-anchor the ladder
//! on the filled level, and a periodic health check repairs or rebuilds it.
//!
//! # Architecture
//!
//! - [`config`] - Grid configuration, engine settings, instrument precision
//! - [`types`] - Core data types (GridLevel, FillEvent, OrderSide, etc.)
//! - [`errors`] - Grid-specific error types
//! - [`strategy`] - Ladder computation around a center
//! - [`state`] - Per-symbol ladder and oid bookkeeping
//! - [`health`] - Completeness and uniformity metrics
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`manager`] - Grid engine: seeding, fills, health checks, drain
//! - [`runner`] - Per-engine event loop
//! - [`dispatcher`] - Routes the account fill stream to engines
//! - [`supervisor`] - Lifecycle of the whole run
//! - [`paper`] - Simulated exchange for paper trading
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use perp_grid::grid::{EngineSettings, GridConfig, Supervisor};
//!
//! let configs = vec![GridConfig::new("BTC", 100.0, 20.0, 5, 20)];
//! let supervisor = Supervisor::new(Arc::new(exchange), configs, EngineSettings::default());
//!
//! let report = supervisor
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! report.log_summary();
//! ```
//!
//! # Testing
//!
//! ```rust,ignore
//! use perp_grid::grid::executor::mock::MockExchange;
//!
//! let exchange = MockExchange::new(50000.0);
//! exchange.set_reject_orders(1).await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod health;
pub mod manager;
pub mod paper;
pub mod runner;
pub mod state;
pub mod strategy;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use config::{EngineSettings, GridConfig, InstrumentPrecision};
pub use dispatcher::{DispatchStats, FillDispatcher};
pub use errors::{GridError, GridResult};
pub use executor::{ExchangeGateway, FillStream, RetryPolicy};
pub use health::{HealthReport, HealthThresholds};
pub use manager::{EngineSummary, GridEngine, HealthOutcome};
pub use paper::{PaperConfig, PaperExchange, PaperMarket};
pub use runner::EngineRunner;
pub use state::GridState;
pub use strategy::GridStrategy;
pub use supervisor::{Exclusion, Supervisor, SupervisorReport, SupervisorState};
pub use types::{
    EngineStatus, FillEvent, GridLevel, GridStats, MarginMode, Oid, OpenOrder, OrderRequest,
    OrderSide, PositionMode,
};
