//! Engine worker loop - one task per symbol

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::executor::ExchangeGateway;
use super::manager::{EngineSummary, GridEngine, HealthOutcome};
use super::types::FillEvent;

/// Drives one seeded engine until the stop signal, then drains it
///
/// Fills, health checks and reports are handled strictly one after another,
/// so the engine's state is never touched concurrently.
pub struct EngineRunner<E: ExchangeGateway> {
    engine: GridEngine<E>,
    fills: UnboundedReceiver<FillEvent>,
}

impl<E: ExchangeGateway> EngineRunner<E> {
    pub fn new(engine: GridEngine<E>, fills: UnboundedReceiver<FillEvent>) -> Self {
        Self { engine, fills }
    }

    pub async fn run(mut self) -> EngineSummary {
        let symbol = self.engine.symbol().to_string();
        let settings = self.engine.settings().clone();
        let mut shutdown = self.engine.shutdown_signal();
        let mut health_timer = periodic(settings.health_check_interval_secs);
        let mut report_timer = periodic(settings.report_interval_secs);
        let mut fills_open = true;

        info!("[{}] Engine running", symbol);

        loop {
            if self.engine.is_stopping() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                fill = self.fills.recv(), if fills_open => match fill {
                    Some(fill) => {
                        let mut batch = vec![fill];
                        batch.extend(self.drain_queued());
                        self.apply(batch).await;
                    }
                    None => {
                        warn!("[{}] Fill channel closed, continuing with health checks only", symbol);
                        fills_open = false;
                    }
                },

                _ = health_timer.tick() => {
                    let pending = self.drain_queued();
                    if !pending.is_empty() {
                        self.apply(pending).await;
                    }
                    match self.engine.run_health_check().await {
                        Ok(HealthOutcome::Healthy) => debug!("[{}] Grid healthy", symbol),
                        Ok(outcome) => info!("[{}] Health check: {:?}", symbol, outcome),
                        Err(e) => error!("[{}] Health check failed: {}", symbol, e),
                    }
                }

                _ = report_timer.tick() => {
                    info!("{}", self.engine.summary());
                }
            }
        }

        info!("[{}] Stop signal received, draining", symbol);
        self.engine.drain().await
    }

    /// Everything already queued, without waiting
    fn drain_queued(&mut self) -> Vec<FillEvent> {
        let mut batch = Vec::new();
        while let Ok(fill) = self.fills.try_recv() {
            batch.push(fill);
        }
        batch
    }

    async fn apply(&mut self, batch: Vec<FillEvent>) {
        let received = batch.len();
        match self.engine.handle_fills(batch).await {
            Ok(applied) if applied < received => debug!(
                "[{}] Applied {}/{} fills",
                self.engine.symbol(),
                applied,
                received
            ),
            Ok(_) => {}
            Err(e) => error!("[{}] Failed to handle fills: {}", self.engine.symbol(), e),
        }
    }
}

/// Interval whose first tick is one full period away
fn periodic(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    use crate::grid::config::{EngineSettings, GridConfig};
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::{EngineStatus, OrderSide};

    const SYMBOL: &str = "ETH";

    struct Harness {
        exchange: Arc<MockExchange>,
        fills: UnboundedSender<FillEvent>,
        stop: watch::Sender<bool>,
        handle: JoinHandle<EngineSummary>,
    }

    async fn start(grid_levels: u32) -> Harness {
        let exchange = Arc::new(MockExchange::new(2000.0));
        let (stop, rx) = watch::channel(false);
        let settings = EngineSettings {
            retry_base_delay_ms: 1,
            health_check_interval_secs: 60,
            ..EngineSettings::default()
        };
        let config = GridConfig::new(SYMBOL, 10.0, 50.0, grid_levels, 10);
        let mut engine = GridEngine::new(config, settings, exchange.clone(), rx);
        engine.seed().await.unwrap();

        let (fills, fill_rx) = unbounded_channel();
        let handle = tokio::spawn(EngineRunner::new(engine, fill_rx).run());
        Harness {
            exchange,
            fills,
            stop,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_is_applied_then_drained() {
        let h = start(2).await;
        let oid = h.exchange.oid_at(SYMBOL, 2010.0).await.unwrap();
        let fill = h.exchange.fill_order(SYMBOL, oid).await.unwrap();
        h.fills.send(fill).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut prices: Vec<f64> = h
            .exchange
            .open_orders(SYMBOL)
            .await
            .iter()
            .map(|o| o.price)
            .collect();
        prices.sort_by(f64::total_cmp);
        assert_eq!(prices, vec![1990.0, 2000.0, 2020.0, 2030.0]);

        h.stop.send(true).unwrap();
        let summary = h.handle.await.unwrap();
        assert_eq!(summary.status, EngineStatus::Stopped);
        assert_eq!(summary.stats.num_fills, 1);
        assert_eq!(summary.center, 2010.0);
        assert!(h.exchange.open_orders(SYMBOL).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_timer_resets_degraded_grid() {
        let h = start(3).await;
        h.exchange
            .drop_orders(SYMBOL, |o| o.side == OrderSide::Buy)
            .await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.exchange.open_orders(SYMBOL).await.len(), 6);

        h.stop.send(true).unwrap();
        let summary = h.handle.await.unwrap();
        assert_eq!(summary.stats.num_resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_any_event() {
        let h = start(2).await;
        let place_calls = h.exchange.place_calls.lock().await.len();

        h.stop.send(true).unwrap();
        let summary = h.handle.await.unwrap();
        assert_eq!(summary.resting_buys + summary.resting_sells, 0);
        assert_eq!(h.exchange.cancel_all_calls.lock().await.len(), 2);
        assert_eq!(h.exchange.place_calls.lock().await.len(), place_calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_fill_channel_keeps_engine_alive() {
        let Harness {
            exchange,
            fills,
            stop,
            handle,
        } = start(2).await;
        drop(fills);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        assert_eq!(exchange.open_orders(SYMBOL).await.len(), 4);

        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap().status, EngineStatus::Stopped);
    }
}
