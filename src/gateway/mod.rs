//! Broker-gateway surface consumed by the execution agent.
//!
//! The core treats the gateway as an opaque capability: place, close, quote,
//! list. Real connectivity lives behind this trait; the bundled simulation
//! implements the same surface for tests and demo runs.

pub mod simulation;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::fabric::types::{Direction, Quote, Symbol};

pub use simulation::{SimulationConfig, SimulationGateway};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Worth retrying: connection hiccups, timeouts.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// The venue said no: not tradable, market closed, size rejected.
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(Symbol),
    #[error("gateway not connected")]
    Disconnected,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub direction: Direction,
    pub size: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Fill confirmation. `executed_size` may be smaller than requested on a
/// partial fill; the remainder is not retried.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub executed_price: f64,
    pub executed_size: f64,
}

#[derive(Debug, Clone)]
pub struct CloseAck {
    pub executed_price: f64,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: Symbol,
    pub display_name: String,
}

#[async_trait]
pub trait TradeGateway: Send + Sync {
    async fn connect(&self) -> Result<bool, GatewayError>;

    /// Best effort; errors are logged by implementations, never surfaced.
    async fn disconnect(&self);

    async fn current_price(&self, symbol: &Symbol) -> Option<Quote>;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn close_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        size: f64,
    ) -> Result<CloseAck, GatewayError>;

    /// Symbols currently tradable on `market`. Empty on failure.
    async fn list_active_symbols(&self, market: &str) -> Vec<SymbolInfo>;
}

/// Connect with exponential backoff on transient failures. Permanent
/// failures propagate immediately.
pub async fn connect_with_backoff(
    gateway: &dyn TradeGateway,
    max_attempts: u32,
) -> Result<(), GatewayError> {
    let mut delay = std::time::Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match gateway.connect().await {
            Ok(true) => return Ok(()),
            Ok(false) | Err(GatewayError::Transient(_)) | Err(GatewayError::Disconnected)
                if attempt < max_attempts =>
            {
                warn!(attempt, ?delay, "gateway connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Ok(false) => return Err(GatewayError::Transient("connect refused".into())),
            Err(err) => return Err(err),
        }
    }
}
