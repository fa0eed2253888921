//! Supervisor - starts one engine per symbol and drives coordinated shutdown

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use super::config::{EngineSettings, GridConfig};
use super::dispatcher::{DispatchStats, FillDispatcher};
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, FillStream};
use super::manager::{EngineSummary, GridEngine};
use super::runner::EngineRunner;

/// Upper bound for the cancel-all sent on behalf of an aborted engine
const BEST_EFFORT_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// A symbol that never got a running engine
#[derive(Debug, Clone, PartialEq)]
pub struct Exclusion {
    pub symbol: String,
    pub reason: String,
}

/// Outcome of a full run
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    /// Engines that drained within the grace period
    pub engines: Vec<EngineSummary>,
    pub excluded: Vec<Exclusion>,
    /// Symbols whose engine had to be aborted
    pub aborted: Vec<String>,
    pub dispatch: DispatchStats,
}

impl SupervisorReport {
    pub fn log_summary(&self) {
        for engine in &self.engines {
            info!("{}", engine);
        }
        for exclusion in &self.excluded {
            warn!("[{}] Excluded: {}", exclusion.symbol, exclusion.reason);
        }
        for symbol in &self.aborted {
            warn!("[{}] Aborted after grace period", symbol);
        }
        info!(
            "Dispatcher: routed={}, anomalies={}, resubscribes={}",
            self.dispatch.routed, self.dispatch.anomalies, self.dispatch.resubscribes
        );
    }
}

/// Owns the run: validation, seeding, the wait for shutdown, and teardown
pub struct Supervisor<E: ExchangeGateway + 'static> {
    exchange: Arc<E>,
    configs: Vec<GridConfig>,
    settings: EngineSettings,
    state: watch::Sender<SupervisorState>,
}

impl<E: ExchangeGateway + 'static> Supervisor<E> {
    pub fn new(exchange: Arc<E>, configs: Vec<GridConfig>, settings: EngineSettings) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            exchange,
            configs,
            settings,
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
        info!("Supervisor state: {:?}", state);
    }

    /// Run every engine until `shutdown_signal` resolves, then drain them
    ///
    /// The signal is watched from the start. When it resolves while symbols
    /// are still seeding, no further order is placed and every engine is
    /// drained. Fails only when nothing can run: invalid engine settings, no
    /// usable grid, or an authentication failure while starting.
    pub async fn run<F>(self, shutdown_signal: F) -> GridResult<SupervisorReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown_signal);
        self.set_state(SupervisorState::Starting);
        let mut report = SupervisorReport::default();

        if let Err(e) = self.settings.validate() {
            self.set_state(SupervisorState::Stopped);
            return Err(e);
        }

        let accepted = self.accepted_configs(&mut report.excluded);
        if accepted.is_empty() {
            self.set_state(SupervisorState::Stopped);
            return Err(GridError::InvalidConfig("no valid grid configured".into()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = FillDispatcher::new();
        let mut inboxes = Vec::with_capacity(accepted.len());
        for config in &accepted {
            inboxes.push(dispatcher.register(&config.symbol).await);
        }
        let symbols: Vec<String> = accepted.iter().map(|c| c.symbol.clone()).collect();

        let stream: FillStream = match self.exchange.subscribe_fills(&symbols).await {
            Ok(stream) => stream,
            Err(e) if e.is_fatal() => {
                error!("Fill subscription rejected: {}", e);
                self.set_state(SupervisorState::Stopped);
                return Err(e);
            }
            Err(e) => {
                // The dispatcher resubscribes once it sees the stream end
                warn!("Fill subscription failed, retrying in background: {}", e);
                Box::pin(futures_util::stream::empty())
            }
        };
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(
            self.exchange.clone(),
            symbols,
            stream,
            stop_rx.clone(),
            self.settings.resubscribe_base_delay_ms,
        ));

        let seeds = accepted.into_iter().zip(inboxes).map(|(config, inbox)| {
            let mut engine = GridEngine::new(
                config,
                self.settings.clone(),
                self.exchange.clone(),
                stop_rx.clone(),
            );
            async move {
                let result = engine.seed().await;
                (engine, inbox, result)
            }
        });

        let seeding = join_all(seeds);
        tokio::pin!(seeding);
        let mut interrupted = false;
        let outcomes = tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!("Shutdown requested while starting, stopping seeding");
                interrupted = true;
                let _ = stop_tx.send(true);
                seeding.await
            }
            outcomes = &mut seeding => outcomes,
        };

        let mut seeded = Vec::new();
        let mut fatal = None;
        for (mut engine, inbox, result) in outcomes {
            match result {
                Ok(_) => seeded.push((engine, inbox)),
                Err(GridError::ShuttingDown) => {
                    dispatcher.unregister(engine.symbol()).await;
                    report.engines.push(engine.drain().await);
                }
                Err(e) => {
                    let symbol = engine.symbol().to_string();
                    error!("[{}] Seeding failed: {}", symbol, e);
                    dispatcher.unregister(&symbol).await;
                    if !e.is_fatal() {
                        // Clear whatever part of the ladder made it out
                        engine.drain().await;
                    }
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e.clone());
                    }
                    report.excluded.push(Exclusion {
                        symbol,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(e) = fatal {
            error!("Authentication failed during startup, aborting run");
            self.set_state(SupervisorState::Draining);
            let _ = stop_tx.send(true);
            for (mut engine, _) in seeded {
                report.engines.push(engine.drain().await);
            }
            report.dispatch = self.stop_dispatcher(&dispatcher, dispatcher_task).await;
            self.set_state(SupervisorState::Stopped);
            report.log_summary();
            return Err(e);
        }

        if interrupted {
            self.set_state(SupervisorState::Draining);
            for (mut engine, _) in seeded {
                report.engines.push(engine.drain().await);
            }
            report.dispatch = self.stop_dispatcher(&dispatcher, dispatcher_task).await;
            self.set_state(SupervisorState::Stopped);
            report.log_summary();
            return Ok(report);
        }

        if seeded.is_empty() {
            let _ = stop_tx.send(true);
            report.dispatch = self.stop_dispatcher(&dispatcher, dispatcher_task).await;
            self.set_state(SupervisorState::Stopped);
            report.log_summary();
            return Err(GridError::InvalidConfig("no engine could be seeded".into()));
        }

        let workers: Vec<(String, JoinHandle<EngineSummary>)> = seeded
            .into_iter()
            .map(|(engine, inbox)| {
                let symbol = engine.symbol().to_string();
                (symbol, tokio::spawn(EngineRunner::new(engine, inbox).run()))
            })
            .collect();

        self.set_state(SupervisorState::Running);
        info!("{} engines running", workers.len());

        shutdown_signal.await;

        self.set_state(SupervisorState::Draining);
        let _ = stop_tx.send(true);

        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        for (symbol, mut handle) in workers {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(summary)) => report.engines.push(summary),
                Ok(Err(e)) => {
                    error!("[{}] Engine task failed: {}", symbol, e);
                    self.best_effort_cancel(&symbol).await;
                    report.aborted.push(symbol);
                }
                Err(_) => {
                    warn!("[{}] Engine did not drain within {:?}, aborting", symbol, grace);
                    handle.abort();
                    self.best_effort_cancel(&symbol).await;
                    report.aborted.push(symbol);
                }
            }
        }

        report.dispatch = self.stop_dispatcher(&dispatcher, dispatcher_task).await;
        self.set_state(SupervisorState::Stopped);
        report.log_summary();
        Ok(report)
    }

    /// Valid configs with unique symbols, in configured order
    fn accepted_configs(&self, excluded: &mut Vec<Exclusion>) -> Vec<GridConfig> {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for config in &self.configs {
            if let Err(e) = config.validate() {
                error!("[{}] {}", config.symbol, e);
                excluded.push(Exclusion {
                    symbol: config.symbol.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            if !seen.insert(config.symbol.clone()) {
                error!("[{}] Duplicate grid configuration ignored", config.symbol);
                excluded.push(Exclusion {
                    symbol: config.symbol.clone(),
                    reason: "duplicate symbol".into(),
                });
                continue;
            }
            accepted.push(config.clone());
        }
        accepted
    }

    async fn best_effort_cancel(&self, symbol: &str) {
        match timeout(BEST_EFFORT_CANCEL_TIMEOUT, self.exchange.cancel_all(symbol)).await {
            Ok(Ok(n)) => info!("[{}] Cancelled {} orders for aborted engine", symbol, n),
            Ok(Err(e)) => error!("[{}] Orders may remain on the book: {}", symbol, e),
            Err(_) => error!("[{}] Cancel-all timed out, orders may remain on the book", symbol),
        }
    }

    async fn stop_dispatcher(
        &self,
        dispatcher: &FillDispatcher,
        mut task: JoinHandle<DispatchStats>,
    ) -> DispatchStats {
        match timeout(BEST_EFFORT_CANCEL_TIMEOUT, &mut task).await {
            Ok(Ok(stats)) => stats,
            _ => {
                task.abort();
                dispatcher.stats()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::EngineStatus;
    use tokio::sync::oneshot;

    fn settings() -> EngineSettings {
        EngineSettings {
            retry_base_delay_ms: 1,
            shutdown_grace_secs: 1,
            ..EngineSettings::default()
        }
    }

    async fn exchange() -> Arc<MockExchange> {
        let exchange = Arc::new(MockExchange::new(50000.0));
        exchange.set_price("ETH", 2000.0).await;
        exchange
    }

    fn btc() -> GridConfig {
        GridConfig::new("BTC", 100.0, 20.0, 2, 20)
    }

    fn eth() -> GridConfig {
        GridConfig::new("ETH", 10.0, 50.0, 3, 10)
    }

    fn spawn_run(
        supervisor: Supervisor<MockExchange>,
    ) -> (oneshot::Sender<()>, JoinHandle<GridResult<SupervisorReport>>) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor.run(async move {
            let _ = rx.await;
        }));
        (tx, handle)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let exchange = exchange().await;
        let configs = vec![
            btc(),
            GridConfig::new("BAD", -1.0, 20.0, 2, 20),
            eth(),
            GridConfig::new("BTC", 50.0, 20.0, 2, 20),
        ];
        let supervisor = Supervisor::new(exchange.clone(), configs, settings());
        let mut states = supervisor.subscribe_state();
        let (stop, handle) = spawn_run(supervisor);

        states
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        assert_eq!(exchange.open_orders("BTC").await.len(), 4);
        assert_eq!(exchange.open_orders("ETH").await.len(), 6);

        let oid = exchange.oid_at("BTC", 50100.0).await.unwrap();
        exchange.fill_order("BTC", oid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exchange.oid_at("BTC", 50300.0).await.is_some());

        let place_calls = exchange.place_calls.lock().await.len();
        stop.send(()).unwrap();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(*states.borrow(), SupervisorState::Stopped);
        assert_eq!(report.engines.len(), 2);
        assert!(report
            .engines
            .iter()
            .all(|e| e.status == EngineStatus::Stopped));
        assert_eq!(
            report.excluded.iter().map(|e| e.symbol.as_str()).collect::<Vec<_>>(),
            vec!["BAD", "BTC"]
        );
        assert!(report.aborted.is_empty());
        assert_eq!(report.dispatch.routed, 1);

        assert!(exchange.open_orders("BTC").await.is_empty());
        assert!(exchange.open_orders("ETH").await.is_empty());
        let cancel_alls = exchange.cancel_all_calls.lock().await.clone();
        assert_eq!(cancel_alls.iter().filter(|s| *s == "BTC").count(), 2);
        assert_eq!(cancel_alls.iter().filter(|s| *s == "ETH").count(), 2);
        assert_eq!(exchange.place_calls.lock().await.len(), place_calls);
    }

    #[tokio::test]
    async fn test_seeding_failure_excludes_symbol() {
        let exchange = exchange().await;
        // 0.001 of quote per order rounds to a zero quantity
        let configs = vec![btc(), GridConfig::new("ETH", 10.0, 0.001, 2, 10)];
        let supervisor = Supervisor::new(exchange.clone(), configs, settings());
        let mut states = supervisor.subscribe_state();
        let (stop, handle) = spawn_run(supervisor);

        states
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        assert!(exchange.open_orders("ETH").await.is_empty());

        stop.send(()).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.engines.len(), 1);
        assert_eq!(report.engines[0].symbol, "BTC");
        assert_eq!(report.excluded[0].symbol, "ETH");
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_run() {
        let exchange = exchange().await;
        exchange.set_fail_auth(true).await;
        let supervisor = Supervisor::new(exchange.clone(), vec![btc(), eth()], settings());

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(exchange.place_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_signal_before_start_places_nothing() {
        let exchange = exchange().await;
        let supervisor = Supervisor::new(exchange.clone(), vec![btc(), eth()], settings());
        let states = supervisor.subscribe_state();

        let report = supervisor.run(async {}).await.unwrap();

        assert!(exchange.place_calls.lock().await.is_empty());
        assert_eq!(report.engines.len(), 2);
        assert!(report
            .engines
            .iter()
            .all(|e| e.status == EngineStatus::Stopped));
        assert!(report.excluded.is_empty());
        assert_eq!(*states.borrow(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_during_seeding_stops_retries() {
        let exchange = exchange().await;
        exchange.set_fail_place_calls(u32::MAX).await;
        let settings = EngineSettings {
            retry_base_delay_ms: 1000,
            ..settings()
        };
        let supervisor = Supervisor::new(exchange.clone(), vec![btc()], settings);
        let (stop, handle) = spawn_run(supervisor);

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(()).unwrap();
        let report = handle.await.unwrap().unwrap();

        // The first attempt only; the backoff is cut short by the signal
        assert_eq!(*exchange.place_calls.lock().await, vec![("BTC".to_string(), 4)]);
        assert_eq!(report.engines.len(), 1);
        assert_eq!(report.engines[0].status, EngineStatus::Stopped);
        assert!(report.excluded.is_empty());
        assert!(exchange.open_orders("BTC").await.is_empty());
    }

    #[tokio::test]
    async fn test_no_valid_config_fails() {
        let exchange = exchange().await;
        let supervisor = Supervisor::new(
            exchange.clone(),
            vec![GridConfig::new("BTC", 100.0, 20.0, 0, 20)],
            settings(),
        );
        let mut states = supervisor.subscribe_state();

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(*states.borrow_and_update(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_engine_is_aborted_after_grace() {
        let exchange = exchange().await;
        let supervisor = Supervisor::new(exchange.clone(), vec![btc()], settings());
        let mut states = supervisor.subscribe_state();
        let (stop, handle) = spawn_run(supervisor);

        states
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        exchange.set_cancel_all_delay(Duration::from_secs(30)).await;

        stop.send(()).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert!(report.engines.is_empty());
        assert_eq!(report.aborted, vec!["BTC".to_string()]);
        // Drain's own attempt plus the best-effort one
        assert_eq!(
            exchange
                .cancel_all_calls
                .lock()
                .await
                .iter()
                .filter(|s| *s == "BTC")
                .count(),
            3
        );
    }
}
