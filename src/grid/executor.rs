//! Exchange abstraction for grid maintenance - enables mocking for tests

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::config::InstrumentPrecision;
use super::errors::GridResult;
use super::types::{FillEvent, MarginMode, Oid, OpenOrder, OrderRequest, PositionMode};

/// Lazy, infinite stream of fills; once it ends it must be resubscribed
pub type FillStream = BoxStream<'static, FillEvent>;

/// Exchange operations trait - can be mocked for testing
///
/// Implementations own connectivity, authentication and rate limiting. Batch
/// calls return one result per input so callers can retry partial failures.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place limit orders in one request
    async fn place_orders_batch(
        &self,
        symbol: &str,
        orders: &[OrderRequest],
    ) -> GridResult<Vec<GridResult<Oid>>>;

    /// Cancel orders by oid in one request
    async fn cancel_orders_batch(
        &self,
        symbol: &str,
        oids: &[Oid],
    ) -> GridResult<Vec<GridResult<()>>>;

    /// Cancel every open order for a symbol, returning how many were cancelled
    async fn cancel_all(&self, symbol: &str) -> GridResult<u32>;

    /// Subscribe to fills of the given symbols on a single account stream
    async fn subscribe_fills(&self, symbols: &[String]) -> GridResult<FillStream>;

    /// Current open orders for a symbol
    async fn get_open_orders(&self, symbol: &str) -> GridResult<Vec<OpenOrder>>;

    /// Current market price for a symbol
    async fn get_market_price(&self, symbol: &str) -> GridResult<f64>;

    /// Tick and lot size for a symbol
    async fn get_instrument(&self, symbol: &str) -> GridResult<InstrumentPrecision>;

    /// Switch the symbol's margin mode; succeeds when it is already set
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GridResult<()>;

    /// Switch the symbol's position mode; succeeds when it is already set
    async fn set_position_mode(&self, symbol: &str, mode: PositionMode) -> GridResult<()>;

    /// Update leverage for perp trading
    async fn update_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()>;
}

/// Bounded exponential backoff for gateway calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(2u64.pow(exp)))
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for testing grid engines without a real exchange connection.
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::sync::Mutex;

    use crate::grid::errors::GridError;
    use crate::grid::types::OrderSide;

    /// Mock exchange for testing
    pub struct MockExchange {
        pub book: Arc<Mutex<HashMap<String, BTreeMap<Oid, OpenOrder>>>>,
        /// Every order request that reached the book, in order
        pub placed: Arc<Mutex<Vec<(String, OrderRequest)>>>,
        /// Number of orders in each place_orders_batch call
        pub place_calls: Arc<Mutex<Vec<(String, usize)>>>,
        pub cancel_batch_calls: Arc<Mutex<Vec<(String, Vec<Oid>)>>>,
        pub cancel_all_calls: Arc<Mutex<Vec<String>>>,
        pub leverage: Arc<Mutex<HashMap<String, u32>>>,
        pub margin_modes: Arc<Mutex<HashMap<String, MarginMode>>>,
        pub position_modes: Arc<Mutex<HashMap<String, PositionMode>>>,
        pub prices: Arc<Mutex<HashMap<String, f64>>>,
        pub precision: Arc<Mutex<InstrumentPrecision>>,
        /// Whole place calls to fail before succeeding again
        pub fail_place_calls: Arc<Mutex<u32>>,
        /// Individual orders to reject before accepting again
        pub reject_orders: Arc<Mutex<u32>>,
        /// Error handed back for each rejected order
        pub reject_error: Arc<Mutex<GridError>>,
        pub fail_cancel_all: Arc<Mutex<u32>>,
        pub fail_snapshot: Arc<Mutex<bool>>,
        pub fail_auth: Arc<Mutex<bool>>,
        /// Artificial latency of cancel_all, for shutdown timeouts
        pub cancel_all_delay: Arc<Mutex<Duration>>,
        fill_tx: Arc<Mutex<Option<UnboundedSender<FillEvent>>>>,
        next_oid: AtomicU64,
        default_price: f64,
    }

    impl MockExchange {
        pub fn new(mid_price: f64) -> Self {
            Self {
                book: Arc::new(Mutex::new(HashMap::new())),
                placed: Arc::new(Mutex::new(Vec::new())),
                place_calls: Arc::new(Mutex::new(Vec::new())),
                cancel_batch_calls: Arc::new(Mutex::new(Vec::new())),
                cancel_all_calls: Arc::new(Mutex::new(Vec::new())),
                leverage: Arc::new(Mutex::new(HashMap::new())),
                margin_modes: Arc::new(Mutex::new(HashMap::new())),
                position_modes: Arc::new(Mutex::new(HashMap::new())),
                prices: Arc::new(Mutex::new(HashMap::new())),
                precision: Arc::new(Mutex::new(InstrumentPrecision::new(0.1, 0.0001))),
                fail_place_calls: Arc::new(Mutex::new(0)),
                reject_orders: Arc::new(Mutex::new(0)),
                reject_error: Arc::new(Mutex::new(GridError::RateLimited("Mock rejection".into()))),
                fail_cancel_all: Arc::new(Mutex::new(0)),
                fail_snapshot: Arc::new(Mutex::new(false)),
                fail_auth: Arc::new(Mutex::new(false)),
                cancel_all_delay: Arc::new(Mutex::new(Duration::ZERO)),
                fill_tx: Arc::new(Mutex::new(None)),
                next_oid: AtomicU64::new(1),
                default_price: mid_price,
            }
        }

        pub async fn set_price(&self, symbol: &str, price: f64) {
            self.prices.lock().await.insert(symbol.to_string(), price);
        }

        pub async fn set_fail_place_calls(&self, calls: u32) {
            *self.fail_place_calls.lock().await = calls;
        }

        pub async fn set_reject_orders(&self, orders: u32) {
            *self.reject_orders.lock().await = orders;
        }

        pub async fn set_reject_error(&self, error: GridError) {
            *self.reject_error.lock().await = error;
        }

        pub async fn set_fail_cancel_all(&self, calls: u32) {
            *self.fail_cancel_all.lock().await = calls;
        }

        pub async fn set_fail_snapshot(&self, fail: bool) {
            *self.fail_snapshot.lock().await = fail;
        }

        pub async fn set_fail_auth(&self, fail: bool) {
            *self.fail_auth.lock().await = fail;
        }

        pub async fn set_cancel_all_delay(&self, delay: Duration) {
            *self.cancel_all_delay.lock().await = delay;
        }

        /// Open orders resting for a symbol
        pub async fn open_orders(&self, symbol: &str) -> Vec<OpenOrder> {
            self.book
                .lock()
                .await
                .get(symbol)
                .map(|orders| orders.values().cloned().collect())
                .unwrap_or_default()
        }

        /// Find the oid resting at a price
        pub async fn oid_at(&self, symbol: &str, price: f64) -> Option<Oid> {
            self.open_orders(symbol)
                .await
                .into_iter()
                .find(|o| (o.price - price).abs() < 1e-9)
                .map(|o| o.oid)
        }

        /// Fill a resting order completely and publish the event
        pub async fn fill_order(&self, symbol: &str, oid: Oid) -> Option<FillEvent> {
            let order = self.book.lock().await.get_mut(symbol)?.remove(&oid)?;
            let quantity = self
                .placed
                .lock()
                .await
                .iter()
                .rev()
                .find(|(s, r)| s == symbol && r.side == order.side && (r.price - order.price).abs() < 1e-9)
                .map(|(_, r)| r.quantity)
                .unwrap_or(0.0);

            let event = FillEvent {
                symbol: symbol.to_string(),
                oid,
                side: order.side,
                price: order.price,
                quantity,
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            self.publish(event.clone()).await;
            Some(event)
        }

        /// Push an arbitrary event onto the fill stream
        pub async fn publish(&self, event: FillEvent) {
            if let Some(tx) = self.fill_tx.lock().await.as_ref() {
                let _ = tx.send(event);
            }
        }

        /// End the current fill stream, as a dropped websocket would
        pub async fn close_stream(&self) {
            self.fill_tx.lock().await.take();
        }

        /// Remove orders from the book without notifying anyone
        pub async fn drop_orders<F>(&self, symbol: &str, mut pred: F)
        where
            F: FnMut(&OpenOrder) -> bool,
        {
            if let Some(orders) = self.book.lock().await.get_mut(symbol) {
                orders.retain(|_, o| !pred(&*o));
            }
        }

        /// Rest an order the engine never placed
        pub async fn inject_foreign_order(&self, symbol: &str, price: f64, side: OrderSide) -> Oid {
            let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
            self.book
                .lock()
                .await
                .entry(symbol.to_string())
                .or_default()
                .insert(oid, OpenOrder { oid, price, side });
            oid
        }

        async fn check_auth(&self) -> GridResult<()> {
            if *self.fail_auth.lock().await {
                return Err(GridError::Authentication("Mock invalid api key".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockExchange {
        async fn place_orders_batch(
            &self,
            symbol: &str,
            orders: &[OrderRequest],
        ) -> GridResult<Vec<GridResult<Oid>>> {
            self.check_auth().await?;
            self.place_calls
                .lock()
                .await
                .push((symbol.to_string(), orders.len()));

            {
                let mut fail = self.fail_place_calls.lock().await;
                if *fail > 0 {
                    *fail -= 1;
                    return Err(GridError::Gateway("Mock failure".into()));
                }
            }

            let mut results = Vec::with_capacity(orders.len());
            for order in orders {
                {
                    let mut reject = self.reject_orders.lock().await;
                    if *reject > 0 {
                        *reject -= 1;
                        results.push(Err(self.reject_error.lock().await.clone()));
                        continue;
                    }
                }

                let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
                self.book
                    .lock()
                    .await
                    .entry(symbol.to_string())
                    .or_default()
                    .insert(
                        oid,
                        OpenOrder {
                            oid,
                            price: order.price,
                            side: order.side,
                        },
                    );
                self.placed
                    .lock()
                    .await
                    .push((symbol.to_string(), order.clone()));
                results.push(Ok(oid));
            }
            Ok(results)
        }

        async fn cancel_orders_batch(
            &self,
            symbol: &str,
            oids: &[Oid],
        ) -> GridResult<Vec<GridResult<()>>> {
            self.check_auth().await?;
            self.cancel_batch_calls
                .lock()
                .await
                .push((symbol.to_string(), oids.to_vec()));

            let mut book = self.book.lock().await;
            let orders = book.entry(symbol.to_string()).or_default();
            Ok(oids
                .iter()
                .map(|oid| match orders.remove(oid) {
                    Some(_) => Ok(()),
                    None => Err(GridError::Gateway(format!("Unknown order {}", oid))),
                })
                .collect())
        }

        async fn cancel_all(&self, symbol: &str) -> GridResult<u32> {
            self.check_auth().await?;
            self.cancel_all_calls.lock().await.push(symbol.to_string());

            let delay = *self.cancel_all_delay.lock().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            {
                let mut fail = self.fail_cancel_all.lock().await;
                if *fail > 0 {
                    *fail -= 1;
                    return Err(GridError::Gateway("Mock cancel-all failure".into()));
                }
            }

            let removed = self
                .book
                .lock()
                .await
                .remove(symbol)
                .map(|orders| orders.len())
                .unwrap_or(0);
            Ok(removed as u32)
        }

        async fn subscribe_fills(&self, _symbols: &[String]) -> GridResult<FillStream> {
            self.check_auth().await?;
            let (tx, rx) = unbounded_channel();
            *self.fill_tx.lock().await = Some(tx);

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(Box::pin(stream))
        }

        async fn get_open_orders(&self, symbol: &str) -> GridResult<Vec<OpenOrder>> {
            self.check_auth().await?;
            if *self.fail_snapshot.lock().await {
                return Err(GridError::Gateway("Mock snapshot failure".into()));
            }
            Ok(self.open_orders(symbol).await)
        }

        async fn get_market_price(&self, symbol: &str) -> GridResult<f64> {
            self.check_auth().await?;
            Ok(self
                .prices
                .lock()
                .await
                .get(symbol)
                .copied()
                .unwrap_or(self.default_price))
        }

        async fn get_instrument(&self, _symbol: &str) -> GridResult<InstrumentPrecision> {
            self.check_auth().await?;
            Ok(*self.precision.lock().await)
        }

        async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GridResult<()> {
            self.check_auth().await?;
            self.margin_modes
                .lock()
                .await
                .insert(symbol.to_string(), mode);
            Ok(())
        }

        async fn set_position_mode(&self, symbol: &str, mode: PositionMode) -> GridResult<()> {
            self.check_auth().await?;
            self.position_modes
                .lock()
                .await
                .insert(symbol.to_string(), mode);
            Ok(())
        }

        async fn update_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()> {
            self.check_auth().await?;
            self.leverage
                .lock()
                .await
                .insert(symbol.to_string(), leverage);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use crate::grid::types::OrderSide;
    use futures_util::StreamExt;

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::new(4, 100);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, 10).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_mock_place_and_fill() {
        let exchange = MockExchange::new(100.0);
        let mut fills = exchange.subscribe_fills(&["ETH".to_string()]).await.unwrap();

        let orders = vec![
            OrderRequest::new(-1, OrderSide::Buy, 99.0, 1.0),
            OrderRequest::new(1, OrderSide::Sell, 101.0, 1.0),
        ];
        let results = exchange.place_orders_batch("ETH", &orders).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(exchange.open_orders("ETH").await.len(), 2);

        let oid = exchange.oid_at("ETH", 101.0).await.unwrap();
        let event = exchange.fill_order("ETH", oid).await.unwrap();
        assert_eq!(event.side, OrderSide::Sell);
        assert_eq!(event.quantity, 1.0);

        let received = fills.next().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(exchange.open_orders("ETH").await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_partial_rejection() {
        let exchange = MockExchange::new(100.0);
        exchange.set_reject_orders(1).await;

        let orders = vec![
            OrderRequest::new(-1, OrderSide::Buy, 99.0, 1.0),
            OrderRequest::new(1, OrderSide::Sell, 101.0, 1.0),
        ];
        let results = exchange.place_orders_batch("ETH", &orders).await.unwrap();
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        assert_eq!(exchange.cancel_all("ETH").await.unwrap(), 1);
    }
}
