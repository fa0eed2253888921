//! Paper trading gateway
//!
//! Simulates a random-walk mid price per symbol and fills resting limit
//! orders locally once the mid crosses them. No connection, no money at risk.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{watch, Mutex};

use super::config::InstrumentPrecision;
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, FillStream};
use super::types::{
    FillEvent, MarginMode, Oid, OpenOrder, OrderRequest, OrderSide, PositionMode,
};

/// One simulated instrument
#[derive(Debug, Clone, Deserialize)]
pub struct PaperMarket {
    pub symbol: String,
    pub start_price: f64,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    /// Largest move per step, in basis points of the mid
    #[serde(default = "default_volatility_bps")]
    pub volatility_bps: f64,
}

/// Paper gateway settings
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Milliseconds between price steps
    #[serde(default = "default_step_interval")]
    pub step_interval_ms: u64,
    #[serde(default)]
    pub markets: Vec<PaperMarket>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            step_interval_ms: default_step_interval(),
            markets: Vec::new(),
        }
    }
}

fn default_tick_size() -> f64 {
    0.1
}

fn default_lot_size() -> f64 {
    0.0001
}

fn default_volatility_bps() -> f64 {
    5.0
}

fn default_step_interval() -> u64 {
    500
}

#[derive(Debug, Clone)]
struct PaperOrder {
    side: OrderSide,
    price: f64,
    quantity: f64,
}

impl PaperOrder {
    /// Buy fills when mid <= limit, sell when mid >= limit
    fn crossed_by(&self, mid: f64) -> bool {
        match self.side {
            OrderSide::Buy => mid <= self.price,
            OrderSide::Sell => mid >= self.price,
        }
    }
}

#[derive(Debug)]
struct PaperBook {
    mid: f64,
    precision: InstrumentPrecision,
    volatility_bps: f64,
    leverage: u32,
    margin_mode: MarginMode,
    position_mode: PositionMode,
    orders: BTreeMap<Oid, PaperOrder>,
}

impl PaperBook {
    /// Remove every order the current mid crosses
    fn take_crossed(&mut self, symbol: &str) -> Vec<FillEvent> {
        let mid = self.mid;
        let crossed: Vec<Oid> = self
            .orders
            .iter()
            .filter(|(_, o)| o.crossed_by(mid))
            .map(|(oid, _)| *oid)
            .collect();

        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        crossed
            .into_iter()
            .filter_map(|oid| {
                self.orders.remove(&oid).map(|order| FillEvent {
                    symbol: symbol.to_string(),
                    oid,
                    side: order.side,
                    price: order.price,
                    quantity: order.quantity,
                    timestamp,
                })
            })
            .collect()
    }
}

/// Simulated exchange backing the `grid_bot` binary in paper mode
pub struct PaperExchange {
    books: Mutex<HashMap<String, PaperBook>>,
    fill_tx: Mutex<Option<UnboundedSender<FillEvent>>>,
    next_oid: AtomicU64,
    step_interval: Duration,
}

impl PaperExchange {
    pub fn new(config: &PaperConfig) -> GridResult<Self> {
        let mut books = HashMap::new();
        for market in &config.markets {
            let precision = InstrumentPrecision::new(market.tick_size, market.lot_size);
            precision.validate()?;
            if !(market.start_price > 0.0) {
                return Err(GridError::InvalidConfig(format!(
                    "{}: paper start_price must be positive",
                    market.symbol
                )));
            }
            books.insert(
                market.symbol.clone(),
                PaperBook {
                    mid: precision.round_price(market.start_price, false),
                    precision,
                    volatility_bps: market.volatility_bps.max(0.0),
                    leverage: 1,
                    margin_mode: MarginMode::Isolated,
                    position_mode: PositionMode::Hedge,
                    orders: BTreeMap::new(),
                },
            );
        }

        Ok(Self {
            books: Mutex::new(books),
            fill_tx: Mutex::new(None),
            next_oid: AtomicU64::new(1),
            step_interval: Duration::from_millis(config.step_interval_ms.max(1)),
        })
    }

    /// Move the mid of every market one random step and fill crossed orders
    pub async fn step(&self) -> usize {
        let fills = {
            let mut books = self.books.lock().await;
            let mut rng = rand::thread_rng();
            let mut fills = Vec::new();
            for (symbol, book) in books.iter_mut() {
                let bps = if book.volatility_bps > 0.0 {
                    rng.gen_range(-book.volatility_bps..=book.volatility_bps)
                } else {
                    0.0
                };
                let next = book.mid * (1.0 + bps / 10_000.0);
                book.mid = book.precision.round_price(next, false).max(book.precision.tick_size);
                fills.extend(book.take_crossed(symbol));
            }
            fills
        };
        self.publish(fills).await
    }

    /// Force the mid of one market, filling what it crosses
    pub async fn set_mid(&self, symbol: &str, price: f64) -> GridResult<usize> {
        let fills = {
            let mut books = self.books.lock().await;
            let book = books
                .get_mut(symbol)
                .ok_or_else(|| GridError::UnknownSymbol(symbol.to_string()))?;
            book.mid = book.precision.round_price(price, false);
            book.take_crossed(symbol)
        };
        Ok(self.publish(fills).await)
    }

    async fn publish(&self, fills: Vec<FillEvent>) -> usize {
        let count = fills.len();
        if let Some(tx) = self.fill_tx.lock().await.as_ref() {
            for fill in fills {
                debug!(
                    "[{}] Paper fill {} {} @ {}",
                    fill.symbol,
                    fill.side.as_str(),
                    fill.quantity,
                    fill.price
                );
                let _ = tx.send(fill);
            }
        }
        count
    }

    /// Step prices on a fixed cadence until the stop signal
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.step_interval);
        info!("Paper market simulation started ({:?} per step)", self.step_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.step().await;
                }
            }
        }
        info!("Paper market simulation stopped");
    }

    fn unknown(symbol: &str) -> GridError {
        GridError::InvalidConfig(format!("{} is not listed on the paper exchange", symbol))
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place_orders_batch(
        &self,
        symbol: &str,
        orders: &[OrderRequest],
    ) -> GridResult<Vec<GridResult<Oid>>> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;

        Ok(orders
            .iter()
            .map(|order| {
                if order.quantity <= 0.0 || order.price <= 0.0 {
                    return Err(GridError::InvalidConfig(format!(
                        "rejected order at level {}",
                        order.level_index
                    )));
                }
                let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
                book.orders.insert(
                    oid,
                    PaperOrder {
                        side: order.side,
                        price: order.price,
                        quantity: order.quantity,
                    },
                );
                Ok(oid)
            })
            .collect())
    }

    async fn cancel_orders_batch(
        &self,
        symbol: &str,
        oids: &[Oid],
    ) -> GridResult<Vec<GridResult<()>>> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;
        Ok(oids
            .iter()
            .map(|oid| {
                book.orders
                    .remove(oid)
                    .map(|_| ())
                    .ok_or_else(|| GridError::Gateway(format!("order {} not open", oid)))
            })
            .collect())
    }

    async fn cancel_all(&self, symbol: &str) -> GridResult<u32> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;
        let count = book.orders.len() as u32;
        book.orders.clear();
        Ok(count)
    }

    async fn subscribe_fills(&self, symbols: &[String]) -> GridResult<FillStream> {
        let (tx, rx) = unbounded_channel();
        *self.fill_tx.lock().await = Some(tx);
        info!("Paper fill stream open for {:?}", symbols);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn get_open_orders(&self, symbol: &str) -> GridResult<Vec<OpenOrder>> {
        let books = self.books.lock().await;
        let book = books.get(symbol).ok_or_else(|| Self::unknown(symbol))?;
        Ok(book
            .orders
            .iter()
            .map(|(oid, o)| OpenOrder {
                oid: *oid,
                price: o.price,
                side: o.side,
            })
            .collect())
    }

    async fn get_market_price(&self, symbol: &str) -> GridResult<f64> {
        let books = self.books.lock().await;
        books
            .get(symbol)
            .map(|b| b.mid)
            .ok_or_else(|| Self::unknown(symbol))
    }

    async fn get_instrument(&self, symbol: &str) -> GridResult<InstrumentPrecision> {
        let books = self.books.lock().await;
        books
            .get(symbol)
            .map(|b| b.precision)
            .ok_or_else(|| Self::unknown(symbol))
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GridResult<()> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;
        if book.margin_mode != mode {
            book.margin_mode = mode;
            info!("[{}] Paper margin mode set to {:?}", symbol, mode);
        }
        Ok(())
    }

    async fn set_position_mode(&self, symbol: &str, mode: PositionMode) -> GridResult<()> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;
        if book.position_mode != mode {
            book.position_mode = mode;
            info!("[{}] Paper position mode set to {:?}", symbol, mode);
        }
        Ok(())
    }

    async fn update_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()> {
        let mut books = self.books.lock().await;
        let book = books.get_mut(symbol).ok_or_else(|| Self::unknown(symbol))?;
        book.leverage = leverage;
        info!("[{}] Paper leverage set to {}x", symbol, leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn config() -> PaperConfig {
        PaperConfig {
            step_interval_ms: 100,
            markets: vec![PaperMarket {
                symbol: "BTC".into(),
                start_price: 50000.0,
                tick_size: 0.1,
                lot_size: 0.0001,
                volatility_bps: 5.0,
            }],
        }
    }

    fn ladder() -> Vec<OrderRequest> {
        vec![
            OrderRequest::new(-1, OrderSide::Buy, 49900.0, 0.001),
            OrderRequest::new(1, OrderSide::Sell, 50100.0, 0.001),
        ]
    }

    #[tokio::test]
    async fn test_crossing_mid_fills_order() {
        let exchange = PaperExchange::new(&config()).unwrap();
        let mut fills = exchange.subscribe_fills(&["BTC".into()]).await.unwrap();
        exchange.place_orders_batch("BTC", &ladder()).await.unwrap();

        assert_eq!(exchange.set_mid("BTC", 50050.0).await.unwrap(), 0);
        assert_eq!(exchange.set_mid("BTC", 50100.0).await.unwrap(), 1);

        let fill = fills.next().await.unwrap();
        assert_eq!(fill.side, OrderSide::Sell);
        assert_eq!(fill.price, 50100.0);
        assert_eq!(fill.quantity, 0.001);

        let open = exchange.get_open_orders("BTC").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_random_walk_stays_on_tick() {
        let exchange = PaperExchange::new(&config()).unwrap();
        for _ in 0..200 {
            exchange.step().await;
            let mid = exchange.get_market_price("BTC").await.unwrap();
            assert!(mid > 0.0);
            let ticks = mid / 0.1;
            assert!((ticks - ticks.round()).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_unlisted_symbol_is_config_error() {
        let exchange = PaperExchange::new(&config()).unwrap();
        let err = exchange.get_instrument("DOGE").await.unwrap_err();
        assert!(err.is_config_error());
        assert!(exchange.set_mid("DOGE", 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_paths() {
        let exchange = PaperExchange::new(&config()).unwrap();
        let oids: Vec<Oid> = exchange
            .place_orders_batch("BTC", &ladder())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let results = exchange
            .cancel_orders_batch("BTC", &[oids[0], 999])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(exchange.cancel_all("BTC").await.unwrap(), 1);
        assert!(exchange.get_open_orders("BTC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_account_setup_and_bad_order() {
        let exchange = PaperExchange::new(&config()).unwrap();
        exchange.set_margin_mode("BTC", MarginMode::Cross).await.unwrap();
        exchange
            .set_position_mode("BTC", PositionMode::OneWay)
            .await
            .unwrap();
        // Setting the same mode twice is fine
        exchange.set_margin_mode("BTC", MarginMode::Cross).await.unwrap();
        assert!(exchange
            .set_position_mode("DOGE", PositionMode::OneWay)
            .await
            .unwrap_err()
            .is_config_error());

        let results = exchange
            .place_orders_batch("BTC", &[OrderRequest::new(1, OrderSide::Sell, 50100.0, 0.0)])
            .await
            .unwrap();
        let err = results[0].clone().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_defaults() {
        let parsed: PaperConfig = serde_json::from_str(
            r#"{"markets": [{"symbol": "ETH", "start_price": 2000.0}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.step_interval_ms, 500);
        assert_eq!(parsed.markets[0].tick_size, 0.1);
        assert_eq!(parsed.markets[0].volatility_bps, 5.0);
    }
}
