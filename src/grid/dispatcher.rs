//! Fill dispatcher - routes the account fill stream to per-symbol engines

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, RwLock};

use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, FillStream};
use super::types::FillEvent;

/// Counters reported when the dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub routed: u64,
    /// Events for symbols with no live engine
    pub anomalies: u64,
    pub resubscribes: u64,
}

/// Symbol to engine routing table
///
/// Cloning shares the table, so routes can be dropped while [`run`](Self::run)
/// is consuming the stream on another task.
#[derive(Clone, Default)]
pub struct FillDispatcher {
    routes: Arc<RwLock<HashMap<String, UnboundedSender<FillEvent>>>>,
    routed: Arc<AtomicU64>,
    anomalies: Arc<AtomicU64>,
    resubscribes: Arc<AtomicU64>,
}

impl FillDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `symbol` to a new engine inbox, replacing any previous route
    pub async fn register(&self, symbol: &str) -> UnboundedReceiver<FillEvent> {
        let (tx, rx) = unbounded_channel();
        if self
            .routes
            .write()
            .await
            .insert(symbol.to_string(), tx)
            .is_some()
        {
            warn!("[{}] Replacing existing fill route", symbol);
        }
        rx
    }

    pub async fn unregister(&self, symbol: &str) -> bool {
        self.routes.write().await.remove(symbol).is_some()
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.routes.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            routed: self.routed.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
        }
    }

    /// Forward one event to its engine; anomalies are counted and returned
    pub async fn dispatch(&self, event: FillEvent) -> GridResult<()> {
        let result = match self.routes.read().await.get(&event.symbol) {
            Some(tx) => tx
                .send(event)
                .map_err(|e| GridError::ChannelSend(format!("engine for {} is gone", e.0.symbol))),
            None => Err(GridError::UnknownSymbol(event.symbol)),
        };

        match &result {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping fill: {}", e);
            }
        }
        result
    }

    /// Consume fills until the stop signal, resubscribing when the stream ends
    pub async fn run<E: ExchangeGateway>(
        self,
        exchange: Arc<E>,
        symbols: Vec<String>,
        stream: FillStream,
        mut shutdown: watch::Receiver<bool>,
        resubscribe_base_delay_ms: u64,
    ) -> DispatchStats {
        let mut stream = Some(stream);
        let mut failures: u32 = 0;

        info!("Fill dispatcher started for {} symbols", symbols.len());

        loop {
            if *shutdown.borrow() {
                break;
            }

            match stream.as_mut() {
                Some(events) => {
                    let mut ended = false;
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }

                        event = events.next() => match event {
                            Some(event) => {
                                let _ = self.dispatch(event).await;
                            }
                            None => ended = true,
                        },
                    }
                    if ended {
                        warn!("Fill stream ended, resubscribing");
                        stream = None;
                    }
                }
                None => {
                    let exp = failures.min(6);
                    let delay = Duration::from_millis(resubscribe_base_delay_ms.saturating_mul(1 << exp));
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }

                        _ = tokio::time::sleep(delay) => {
                            match exchange.subscribe_fills(&symbols).await {
                                Ok(events) => {
                                    info!("Resubscribed to fills after {} failed attempts", failures);
                                    self.resubscribes.fetch_add(1, Ordering::Relaxed);
                                    failures = 0;
                                    stream = Some(events);
                                }
                                Err(e) => {
                                    failures = failures.saturating_add(1);
                                    warn!("Fill resubscription failed (attempt {}): {}", failures, e);
                                }
                            }
                        }
                    }
                }
            }
        }

        let stats = self.stats();
        debug!("Fill dispatcher stopped: {:?}", stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::OrderSide;

    fn fill(symbol: &str, oid: u64) -> FillEvent {
        FillEvent {
            symbol: symbol.to_string(),
            oid,
            side: OrderSide::Buy,
            price: 100.0,
            quantity: 1.0,
            timestamp: oid,
        }
    }

    #[tokio::test]
    async fn test_routes_by_symbol_in_order() {
        let dispatcher = FillDispatcher::new();
        let mut btc = dispatcher.register("BTC").await;
        let mut eth = dispatcher.register("ETH").await;

        for oid in 1..=3 {
            dispatcher.dispatch(fill("BTC", oid)).await.unwrap();
        }
        dispatcher.dispatch(fill("ETH", 10)).await.unwrap();

        let oids: Vec<u64> = (0..3).map(|_| btc.try_recv().unwrap().oid).collect();
        assert_eq!(oids, vec![1, 2, 3]);
        assert_eq!(eth.try_recv().unwrap().oid, 10);
        assert!(btc.try_recv().is_err());
        assert_eq!(dispatcher.stats().routed, 4);
    }

    #[tokio::test]
    async fn test_unknown_and_gone_symbols_are_anomalies() {
        let dispatcher = FillDispatcher::new();
        let rx = dispatcher.register("SOL").await;

        let err = dispatcher.dispatch(fill("DOGE", 1)).await.unwrap_err();
        assert!(matches!(err, GridError::UnknownSymbol(s) if s == "DOGE"));

        drop(rx);
        assert!(matches!(
            dispatcher.dispatch(fill("SOL", 2)).await,
            Err(GridError::ChannelSend(_))
        ));

        dispatcher.register("ARB").await;
        assert!(dispatcher.unregister("ARB").await);
        assert!(dispatcher.dispatch(fill("ARB", 3)).await.is_err());

        let stats = dispatcher.stats();
        assert_eq!(stats.routed, 0);
        assert_eq!(stats.anomalies, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resubscribes_after_stream_ends() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let dispatcher = FillDispatcher::new();
        let mut btc = dispatcher.register("BTC").await;
        let symbols = vec!["BTC".to_string()];
        let stream = exchange.subscribe_fills(&symbols).await.unwrap();
        let (stop, rx) = watch::channel(false);

        let handle = tokio::spawn(dispatcher.clone().run(
            exchange.clone(),
            symbols,
            stream,
            rx,
            100,
        ));

        exchange.publish(fill("BTC", 1)).await;
        assert_eq!(btc.recv().await.unwrap().oid, 1);

        exchange.close_stream().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        exchange.publish(fill("BTC", 2)).await;
        exchange.publish(fill("XRP", 3)).await;
        assert_eq!(btc.recv().await.unwrap().oid, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        stop.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.routed, 2);
        assert_eq!(stats.resubscribes, 1);
        assert_eq!(stats.anomalies, 1);
    }
}
