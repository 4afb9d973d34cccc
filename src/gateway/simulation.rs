//! Simulated trade gateway.
//!
//! Keeps an in-memory quote table with an optional random walk, fills market
//! orders at the touch plus a configurable slippage model, and tracks the
//! open simulated orders so closes can be validated. Deterministic when the
//! walk is disabled and prices are driven through `set_price`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CloseAck, GatewayError, OrderAck, OrderRequest, SymbolInfo, TradeGateway};
use crate::fabric::types::{Direction, Quote, Symbol};

/// How fills deviate from the touch, always adversely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageModel {
    /// A fixed number of pips.
    Fixed { pips: f64 },
    /// A fraction of the fill price.
    Proportional { fraction: f64 },
}

impl Default for SlippageModel {
    fn default() -> Self {
        SlippageModel::Fixed { pips: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub demo: bool,
    pub slippage: SlippageModel,
    /// Random-walk quotes on every read. Off for deterministic tests.
    pub drift: bool,
    /// Fraction of the requested size actually filled. Test hook for the
    /// partial-fill path; 1.0 in normal operation.
    pub fill_ratio: f64,
    pub initial_quotes: Vec<(Symbol, f64, f64)>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            demo: true,
            slippage: SlippageModel::default(),
            drift: true,
            fill_ratio: 1.0,
            initial_quotes: vec![
                (Symbol::from("EUR/USD"), 1.1000, 1.1002),
                (Symbol::from("GBP/USD"), 1.2700, 1.2703),
                (Symbol::from("USD/JPY"), 149.50, 149.53),
                (Symbol::from("AUD/USD"), 0.6550, 0.6552),
                (Symbol::from("USD/CHF"), 0.8800, 0.8802),
                (Symbol::from("USD/CAD"), 1.3600, 1.3603),
                (Symbol::from("NZD/USD"), 0.5900, 0.5902),
            ],
        }
    }
}

struct SimOrder {
    symbol: Symbol,
    direction: Direction,
    remaining: f64,
}

pub struct SimulationGateway {
    cfg: SimulationConfig,
    connected: AtomicBool,
    next_order: AtomicU64,
    quotes: Mutex<HashMap<Symbol, Quote>>,
    orders: Mutex<HashMap<String, SimOrder>>,
}

impl SimulationGateway {
    pub fn new(cfg: SimulationConfig) -> SimulationGateway {
        let quotes = cfg
            .initial_quotes
            .iter()
            .map(|(s, bid, ask)| (s.clone(), Quote::new(*bid, *ask)))
            .collect();
        SimulationGateway {
            cfg,
            connected: AtomicBool::new(false),
            next_order: AtomicU64::new(1),
            quotes: Mutex::new(quotes),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a quote. Drives price-sensitive tests and demo scenarios.
    pub fn set_price(&self, symbol: &Symbol, bid: f64, ask: f64) {
        self.quotes
            .lock()
            .insert(symbol.clone(), Quote::new(bid, ask));
    }

    /// Drop a symbol from the active set, as if the venue delisted it.
    pub fn remove_symbol(&self, symbol: &Symbol) {
        self.quotes.lock().remove(symbol);
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.lock().len()
    }

    fn slip(&self, symbol: &Symbol, price: f64, adverse_up: bool) -> f64 {
        let amount = match self.cfg.slippage {
            SlippageModel::Fixed { pips } => symbol.pips_to_price(pips),
            SlippageModel::Proportional { fraction } => price * fraction,
        };
        if adverse_up {
            price + amount
        } else {
            (price - amount).max(0.0)
        }
    }

    fn walk(&self, symbol: &Symbol, quote: Quote) -> Quote {
        if !self.cfg.drift {
            return quote;
        }
        let pip = symbol.pip_size();
        let delta = rand::thread_rng().gen_range(-0.3..0.3) * pip;
        Quote::new((quote.bid + delta).max(pip), (quote.ask + delta).max(pip * 2.0))
    }
}

#[async_trait]
impl TradeGateway for SimulationGateway {
    async fn connect(&self) -> Result<bool, GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        info!(demo = self.cfg.demo, "✅ simulation gateway connected");
        Ok(true)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("simulation gateway disconnected");
    }

    async fn current_price(&self, symbol: &Symbol) -> Option<Quote> {
        let current = { self.quotes.lock().get(symbol).copied() }?;
        let walked = self.walk(symbol, current);
        if self.cfg.drift {
            self.quotes.lock().insert(symbol.clone(), walked);
        }
        Some(walked)
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, GatewayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::Disconnected);
        }
        let quote = self
            .quotes
            .lock()
            .get(&request.symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(request.symbol.clone()))?;
        if request.size <= 0.0 {
            return Err(GatewayError::Rejected("non-positive size".into()));
        }

        let touch = match request.order_type {
            super::OrderType::Market => quote.entry_price(request.direction),
            super::OrderType::Limit => request.price.unwrap_or(quote.entry_price(request.direction)),
        };
        // Longs pay up, shorts receive less.
        let executed_price = self.slip(
            &request.symbol,
            touch,
            request.direction != Direction::Short,
        );
        let executed_size = request.size * self.cfg.fill_ratio.clamp(0.0, 1.0);
        if executed_size <= 0.0 {
            return Err(GatewayError::Rejected("zero fill".into()));
        }

        let order_id = format!("sim-{}", self.next_order.fetch_add(1, Ordering::Relaxed));
        self.orders.lock().insert(
            order_id.clone(),
            SimOrder {
                symbol: request.symbol.clone(),
                direction: request.direction,
                remaining: executed_size,
            },
        );
        debug!(
            order = %order_id,
            symbol = %request.symbol,
            direction = request.direction.as_str(),
            executed_price,
            executed_size,
            "order filled"
        );
        Ok(OrderAck {
            order_id,
            executed_price,
            executed_size,
        })
    }

    async fn close_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        size: f64,
    ) -> Result<CloseAck, GatewayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::Disconnected);
        }
        let direction = {
            let mut orders = self.orders.lock();
            let order = orders
                .get_mut(order_id)
                .ok_or_else(|| GatewayError::Rejected(format!("unknown order {order_id}")))?;
            if order.symbol != *symbol {
                return Err(GatewayError::Rejected(format!(
                    "order {order_id} is not on {symbol}"
                )));
            }
            order.remaining -= size;
            let direction = order.direction;
            if order.remaining <= f64::EPSILON {
                orders.remove(order_id);
            }
            direction
        };
        let quote = self
            .quotes
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.clone()))?;
        // Exits slip the other way: longs receive less, shorts pay up.
        let executed_price = self.slip(
            symbol,
            quote.exit_price(direction),
            direction == Direction::Short,
        );
        Ok(CloseAck { executed_price })
    }

    async fn list_active_symbols(&self, _market: &str) -> Vec<SymbolInfo> {
        self.quotes
            .lock()
            .keys()
            .map(|symbol| SymbolInfo {
                display_name: symbol.as_str().to_string(),
                symbol: symbol.clone(),
            })
            .collect()
    }
}
