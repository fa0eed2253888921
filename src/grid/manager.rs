//! Grid engine - per-symbol ladder maintenance

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::config::{EngineSettings, GridConfig};
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, RetryPolicy};
use super::health::{self, HealthThresholds};
use super::state::GridState;
use super::strategy::GridStrategy;
use super::types::{EngineStatus, FillEvent, GridStats, MarginMode, Oid, OrderSide, PositionMode};

/// What a health check ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum HealthOutcome {
    /// Engine not running, or no snapshot this tick
    Skipped,
    Healthy,
    /// Levels whose orders disappeared were placed again
    Repaired(usize),
    Reset,
}

/// Owns the ladder of one symbol and every order it sends
///
/// The engine is driven from a single task, so all mutation of its
/// [`GridState`] happens serially and without locks.
pub struct GridEngine<E: ExchangeGateway> {
    config: GridConfig,
    settings: EngineSettings,
    exchange: Arc<E>,
    /// Available once the instrument precision is known
    strategy: Option<GridStrategy>,
    state: Option<GridState>,
    status: EngineStatus,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl<E: ExchangeGateway> GridEngine<E> {
    pub fn new(
        config: GridConfig,
        settings: EngineSettings,
        exchange: Arc<E>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let retry = RetryPolicy::new(settings.max_order_retries, settings.retry_base_delay_ms);
        Self {
            config,
            settings,
            exchange,
            strategy: None,
            state: None,
            status: EngineStatus::Idle,
            retry,
            shutdown,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn state(&self) -> Option<&GridState> {
        self.state.as_ref()
    }

    /// A fresh handle on the stop broadcast
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Whether the stop signal has been raised (or its sender is gone)
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_status(&mut self, status: EngineStatus) {
        if self.status != status {
            debug!("[{}] Engine status {:?} -> {:?}", self.config.symbol, self.status, status);
            self.status = status;
        }
    }

    fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            completeness: self.settings.completeness_threshold,
            uniformity: self.settings.uniformity_threshold,
        }
    }

    /// Fetch precision, set up the account, clear stale orders and place the first ladder
    ///
    /// The account is switched to cross margin and one-way positions before
    /// leverage is set.
    ///
    /// Returns the number of orders that reached the book. Fails when none did.
    pub async fn seed(&mut self) -> GridResult<usize> {
        if self.is_stopping() {
            return Err(GridError::ShuttingDown);
        }
        self.set_status(EngineStatus::Seeding);
        let symbol = self.config.symbol.clone();

        let precision = self.exchange.get_instrument(&symbol).await?;
        let strategy = GridStrategy::new(self.config.clone(), precision)?;
        info!(
            "[{}] Instrument precision: tick={}, lot={}",
            symbol, precision.tick_size, precision.lot_size
        );

        self.exchange
            .set_margin_mode(&symbol, MarginMode::Cross)
            .await?;
        self.exchange
            .set_position_mode(&symbol, PositionMode::OneWay)
            .await?;
        self.exchange
            .update_leverage(&symbol, self.config.leverage)
            .await?;
        info!("[{}] Cross margin, one-way mode, {}x leverage", symbol, self.config.leverage);

        let stale = self.cancel_all_with_retry().await?;
        if stale > 0 {
            info!("[{}] Cancelled {} stale orders before seeding", symbol, stale);
        }

        let center = self.exchange.get_market_price(&symbol).await?;
        let levels = strategy.build_initial_levels(center)?;
        self.state = Some(GridState::new(center, levels));
        self.strategy = Some(strategy);

        let placed = self.place_vacant().await?;
        if placed == 0 {
            if self.is_stopping() {
                return Err(GridError::ShuttingDown);
            }
            return Err(GridError::RetriesExhausted {
                attempts: self.retry.max_attempts,
                reason: format!("no seed order for {} was accepted", symbol),
            });
        }

        self.set_status(EngineStatus::Running);
        info!(
            "[{}] Grid seeded around {} with {}/{} orders",
            symbol,
            center,
            placed,
            self.config.num_slots()
        );
        Ok(placed)
    }

    /// Apply a batch of fills, then send one batch cancel and one batch place
    ///
    /// Fills for orders the engine does not hold are ignored, so duplicate
    /// deliveries leave the state untouched. Returns the number of fills applied.
    pub async fn handle_fills(&mut self, fills: Vec<FillEvent>) -> GridResult<usize> {
        if matches!(
            self.status,
            EngineStatus::Idle | EngineStatus::Draining | EngineStatus::Stopped
        ) {
            debug!(
                "[{}] Dropping {} fills while {:?}",
                self.config.symbol,
                fills.len(),
                self.status
            );
            return Ok(0);
        }

        let symbol = self.config.symbol.clone();
        let spacing = self.config.spacing;
        let (Some(strategy), Some(state)) = (self.strategy.as_ref(), self.state.as_mut()) else {
            return Ok(0);
        };

        let mut applied = 0;
        let mut orphaned: Vec<Oid> = Vec::new();

        for fill in &fills {
            let Some(index) = state.find_index_by_oid(fill.oid) else {
                debug!("[{}] Ignoring fill for unknown oid {}", symbol, fill.oid);
                continue;
            };

            if let Some(level) = state.level(index) {
                if level.side != fill.side {
                    warn!(
                        "[{}] Fill side {} disagrees with level {} side {}",
                        symbol,
                        fill.side.as_str(),
                        index,
                        level.side.as_str()
                    );
                }
            }

            state.vacate(index);
            state.stats.record_fill(fill, spacing);

            let center = strategy.re_anchored_center(state.center, index);
            let levels = match strategy.build_initial_levels(center) {
                Ok(levels) => levels,
                Err(e) => {
                    // Level stays vacant; the next health check rebuilds at market
                    warn!("[{}] Cannot re-anchor on {}: {}", symbol, center, e);
                    continue;
                }
            };
            orphaned.extend(state.re_anchor(center, levels, strategy.precision()));
            applied += 1;

            info!(
                "[{}] {} filled at {} (level {}, qty {}), center -> {}",
                symbol,
                fill.side.as_str(),
                fill.price,
                index,
                fill.quantity,
                center
            );
        }

        if applied == 0 {
            return Ok(0);
        }

        if !orphaned.is_empty() {
            match self.cancel_orders(&orphaned).await {
                Ok(n) => debug!("[{}] Cancelled {}/{} orphaned orders", symbol, n, orphaned.len()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("[{}] Failed to cancel orphaned orders: {}", symbol, e),
            }
        }

        self.place_vacant().await?;
        Ok(applied)
    }

    /// Compare the ladder with the exchange and repair or reset it
    pub async fn run_health_check(&mut self) -> GridResult<HealthOutcome> {
        if self.status != EngineStatus::Running || self.is_stopping() {
            return Ok(HealthOutcome::Skipped);
        }
        let symbol = self.config.symbol.clone();

        let snapshot = match self.exchange.get_open_orders(&symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("[{}] Open-orders snapshot failed, retrying next tick: {}", symbol, e);
                return Ok(HealthOutcome::Skipped);
            }
        };

        let thresholds = self.thresholds();
        let (Some(strategy), Some(state)) = (self.strategy.as_ref(), self.state.as_mut()) else {
            return Ok(HealthOutcome::Skipped);
        };
        let report = health::evaluate(state, &snapshot, self.config.spacing, strategy.precision());
        state.touch_health_check();

        debug!(
            "[{}] Health: completeness={:.2}, uniformity={:.2}, missing={}, unknown={}, mismatched={}",
            symbol,
            report.completeness,
            report.uniformity,
            report.missing.len(),
            report.unknown.len(),
            report.mismatched.len()
        );

        if report.needs_reset(&thresholds) {
            if report.is_stale() {
                let stale = GridError::StaleData(format!(
                    "{} unknown and {} mismatched orders",
                    report.unknown.len(),
                    report.mismatched.len()
                ));
                warn!("[{}] {}", symbol, stale);
            }
            info!(
                "[{}] Grid unhealthy (completeness {:.2}, uniformity {:.2}), resetting",
                symbol, report.completeness, report.uniformity
            );
            self.reset().await?;
            return Ok(HealthOutcome::Reset);
        }

        if report.missing.is_empty() {
            return Ok(HealthOutcome::Healthy);
        }

        for index in &report.missing {
            state.vacate(*index);
        }
        info!(
            "[{}] {} levels lost their orders, placing again",
            symbol,
            report.missing.len()
        );
        let placed = self.place_vacant().await?;
        Ok(HealthOutcome::Repaired(placed))
    }

    /// Cancel everything and rebuild the ladder at the current market price
    ///
    /// When cancel-all fails the ladder is left as it was.
    pub async fn reset(&mut self) -> GridResult<()> {
        let symbol = self.config.symbol.clone();
        let previous = self.status;
        self.set_status(EngineStatus::Resetting);

        if let Err(e) = self.cancel_all_with_retry().await {
            error!("[{}] Reset aborted, cancel-all failed: {}", symbol, e);
            self.set_status(previous);
            return Err(e);
        }

        let Some(strategy) = self.strategy.as_ref() else {
            self.set_status(previous);
            return Err(GridError::StaleData(format!("{} reset before seeding", symbol)));
        };
        if let Some(state) = self.state.as_mut() {
            state.vacate_all();
            state.stats.record_reset();
        }

        let rebuilt = match self.exchange.get_market_price(&symbol).await {
            Ok(center) => strategy.build_initial_levels(center).map(|levels| (center, levels)),
            Err(e) => Err(e),
        };
        let (center, levels) = match rebuilt {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                // Vacated ladder keeps its shape; the next check resets again
                error!("[{}] Reset could not rebuild the ladder: {}", symbol, e);
                self.set_status(EngineStatus::Running);
                return Err(e);
            }
        };

        if let Some(state) = self.state.as_mut() {
            state.re_anchor(center, levels, strategy.precision());
        }
        self.set_status(EngineStatus::Running);

        let placed = self.place_vacant().await?;
        info!(
            "[{}] Grid reset around {} with {}/{} orders",
            symbol,
            center,
            placed,
            self.config.num_slots()
        );
        Ok(())
    }

    /// Final cancel-all; falls back to cancelling the orders the engine knows
    pub async fn drain(&mut self) -> EngineSummary {
        let symbol = self.config.symbol.clone();
        self.set_status(EngineStatus::Draining);

        match self.cancel_all_with_retry().await {
            Ok(n) => info!("[{}] Drain cancelled {} orders", symbol, n),
            Err(e) => {
                let oids = self
                    .state
                    .as_ref()
                    .map(|s| s.resting_oids())
                    .unwrap_or_default();
                warn!(
                    "[{}] Cancel-all failed during drain ({}), cancelling {} known orders",
                    symbol,
                    e,
                    oids.len()
                );
                if let Err(e) = self.cancel_orders(&oids).await {
                    error!("[{}] Orders may remain on the book: {}", symbol, e);
                }
            }
        }

        if let Some(state) = self.state.as_mut() {
            state.vacate_all();
        }
        self.set_status(EngineStatus::Stopped);

        let summary = self.summary();
        info!("{}", summary);
        summary
    }

    /// Place every vacant level, retrying only the entries that failed
    ///
    /// Stops early once the stop signal is raised. Rejections that cannot
    /// succeed on a retry are given up at once. Levels still failing after the
    /// last attempt stay vacant for the next health check.
    async fn place_vacant(&mut self) -> GridResult<usize> {
        let symbol = self.config.symbol.clone();
        let mut pending = match self.state.as_ref() {
            Some(state) => state.vacant_requests(),
            None => return Ok(0),
        };
        let mut placed = 0;
        let mut given_up = 0;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if pending.is_empty() {
                break;
            }
            if !self.status.can_place() || self.is_stopping() {
                debug!("[{}] Stop requested, not placing {} orders", symbol, pending.len());
                return Ok(placed);
            }

            match self.exchange.place_orders_batch(&symbol, &pending).await {
                Ok(results) => {
                    let Some(state) = self.state.as_mut() else {
                        return Ok(placed);
                    };
                    let mut results = results.into_iter();
                    let mut failed = Vec::new();
                    for request in pending {
                        match results.next() {
                            Some(Ok(oid)) => match state.occupy(request.level_index, oid) {
                                Ok(()) => placed += 1,
                                Err(e) => warn!("[{}] Placed oid {} but {}", symbol, oid, e),
                            },
                            Some(Err(e)) if e.is_fatal() => return Err(e),
                            Some(Err(e)) if !e.is_retryable() => {
                                warn!(
                                    "[{}] Level {} rejected, not retrying: {}",
                                    symbol, request.level_index, e
                                );
                                last_error = e.to_string();
                                given_up += 1;
                            }
                            Some(Err(e)) => {
                                debug!(
                                    "[{}] Level {} rejected: {}",
                                    symbol, request.level_index, e
                                );
                                last_error = e.to_string();
                                failed.push(request);
                            }
                            None => failed.push(request),
                        }
                    }
                    pending = failed;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if !e.is_retryable() => {
                    warn!("[{}] Batch place rejected, not retrying: {}", symbol, e);
                    last_error = e.to_string();
                    break;
                }
                Err(e) => {
                    warn!(
                        "[{}] Batch place attempt {}/{} failed: {}",
                        symbol, attempt, self.retry.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }

            if !pending.is_empty() && attempt < self.retry.max_attempts && !self.backoff(attempt).await {
                return Ok(placed);
            }
        }

        let vacant = pending.len() + given_up;
        if vacant > 0 {
            warn!("[{}] Leaving {} levels vacant: {}", symbol, vacant, last_error);
        }
        Ok(placed)
    }

    /// Sleep before the next attempt; false when the stop signal interrupts it
    async fn backoff(&mut self, attempt: u32) -> bool {
        let sleep = tokio::time::sleep(self.retry.delay_after(attempt));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    async fn cancel_orders(&self, oids: &[Oid]) -> GridResult<usize> {
        if oids.is_empty() {
            return Ok(0);
        }
        let symbol = &self.config.symbol;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.exchange.cancel_orders_batch(symbol, oids).await {
                Ok(results) => {
                    let cancelled = results.iter().filter(|r| r.is_ok()).count();
                    if cancelled < oids.len() {
                        // Usually filled or cancelled already
                        debug!(
                            "[{}] {} of {} cancels rejected",
                            symbol,
                            oids.len() - cancelled,
                            oids.len()
                        );
                    }
                    return Ok(cancelled);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] Batch cancel attempt {}/{} failed: {}",
                        symbol, attempt, self.retry.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        Err(GridError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }

    async fn cancel_all_with_retry(&self) -> GridResult<u32> {
        let symbol = &self.config.symbol;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.exchange.cancel_all(symbol).await {
                Ok(n) => return Ok(n),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] Cancel-all attempt {}/{} failed: {}",
                        symbol, attempt, self.retry.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        Err(GridError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }

    /// Snapshot of the engine for reports
    pub fn summary(&self) -> EngineSummary {
        let (center, resting_buys, resting_sells, stats) = match self.state.as_ref() {
            Some(state) => (
                state.center,
                state.count_resting(OrderSide::Buy),
                state.count_resting(OrderSide::Sell),
                state.stats.clone(),
            ),
            None => (0.0, 0, 0, GridStats::default()),
        };
        EngineSummary {
            symbol: self.config.symbol.clone(),
            status: self.status,
            center,
            resting_buys,
            resting_sells,
            stats,
        }
    }
}

/// Point-in-time summary of one engine
#[derive(Debug, Clone)]
pub struct EngineSummary {
    pub symbol: String,
    pub status: EngineStatus,
    pub center: f64,
    pub resting_buys: usize,
    pub resting_sells: usize,
    pub stats: GridStats,
}

impl fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?}: center={}, buys={}, sells={}, fills={} ({}B/{}S), round_trips={}, notional={:.2}, est_profit={:.4}, resets={}",
            self.symbol,
            self.status,
            self.center,
            self.resting_buys,
            self.resting_sells,
            self.stats.num_fills,
            self.stats.num_buys,
            self.stats.num_sells,
            self.stats.num_round_trips,
            self.stats.total_notional,
            self.stats.estimated_grid_profit,
            self.stats.num_resets
        )
    }
}
