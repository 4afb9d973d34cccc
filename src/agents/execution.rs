//! Trade execution agent.
//!
//! Owns the gateway. Approved proposals wait in a pending table until a
//! quote is available and the market has not moved unfavourably; fills
//! become open positions tracked every tick for stop-loss, take-profit and
//! the maximum-hold deadline. When both protective levels trigger on the
//! same tick the stop wins. Exactly one `trade_result` is emitted per
//! execution id, including the shutdown close-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{
    MarketQuote, Message, MessageKind, Payload, SystemEvent, TradeExecution, TradeProposal,
    TradeResult,
};
use crate::fabric::types::{
    CloseReason, Direction, ExecutionId, ProposalId, Quote, Symbol, TradeStatus,
};
use crate::gateway::{connect_with_backoff, GatewayError, OrderRequest, OrderType, TradeGateway};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub check_interval_secs: u64,
    /// Gateway backend to wire at startup; only "simulation" ships in-tree.
    pub gateway: String,
    pub market: String,
    /// Positions still open after this long are closed with reason `expiry`.
    pub default_hold_minutes: u64,
    /// Re-request availability when the cached copy is older than this.
    pub availability_refresh_secs: u64,
    /// Skip execution when the quote moved against the proposal's intended
    /// entry by more than this fraction.
    pub unfavorable_move_fraction: f64,
    pub asset_selection_agent: String,
    /// Broadcast gateway quotes as `market_data` each cycle. The execution
    /// agent holds the only external connection, so it fans prices in for
    /// the analysis agents.
    pub publish_quotes: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 1,
            gateway: "simulation".into(),
            market: "forex".into(),
            default_hold_minutes: 240,
            availability_refresh_secs: 120,
            unfavorable_move_fraction: 0.002,
            asset_selection_agent: "asset_selection".into(),
            publish_quotes: true,
        }
    }
}

impl ExecutionConfig {
    /// Environment overrides, `FXSWARM_EXEC_*`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("FXSWARM_EXEC_HOLD_MINUTES") {
            if let Ok(n) = v.parse() {
                cfg.default_hold_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("FXSWARM_EXEC_PUBLISH_QUOTES") {
            cfg.publish_quotes = v != "0" && v.to_lowercase() != "false";
        }
        cfg
    }
}

struct PendingApproval {
    proposal: TradeProposal,
}

struct OpenPosition {
    execution: TradeExecution,
    order_id: String,
    stop_price: Option<f64>,
    take_price: Option<f64>,
    hold_deadline: Instant,
}

struct AvailabilityCache {
    available: Vec<Symbol>,
    recommended: Vec<Symbol>,
    fetched: Instant,
}

pub struct ExecutionAgent {
    id: String,
    cfg: ExecutionConfig,
    gate: PeriodicGate,
    gateway: Arc<dyn TradeGateway>,
    pending: HashMap<ProposalId, PendingApproval>,
    /// Every proposal id ever handled; repeats are dropped.
    seen: HashSet<ProposalId>,
    open: HashMap<ExecutionId, OpenPosition>,
    results_sent: HashSet<ExecutionId>,
    availability: Option<AvailabilityCache>,
}

impl ExecutionAgent {
    pub fn new(
        id: impl Into<String>,
        cfg: ExecutionConfig,
        gateway: Arc<dyn TradeGateway>,
    ) -> ExecutionAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.check_interval_secs));
        ExecutionAgent {
            id: id.into(),
            cfg,
            gate,
            gateway,
            pending: HashMap::new(),
            seen: HashSet::new(),
            open: HashMap::new(),
            results_sent: HashSet::new(),
            availability: None,
        }
    }

    pub fn open_positions(&self) -> usize {
        self.open.len()
    }

    // ── Availability and symbol substitution ──

    fn availability_stale(&self) -> bool {
        match &self.availability {
            None => true,
            Some(cache) => {
                cache.fetched.elapsed() > Duration::from_secs(self.cfg.availability_refresh_secs)
            }
        }
    }

    fn cache_availability(&mut self, available: &[Symbol], recommended: &[Symbol]) {
        self.availability = Some(AvailabilityCache {
            available: available.to_vec(),
            recommended: recommended.to_vec(),
            fetched: Instant::now(),
        });
    }

    /// Resolve the symbol a proposal will actually trade. With no cached
    /// availability the requested symbol stands. An unavailable symbol is
    /// replaced by a recommended (then any available) pair sharing one of
    /// its currencies; with no such pair the trade cannot proceed.
    fn resolve_symbol(&self, requested: &Symbol) -> Option<Symbol> {
        let Some(cache) = &self.availability else {
            return Some(requested.clone());
        };
        if cache.available.contains(requested) {
            return Some(requested.clone());
        }
        cache
            .recommended
            .iter()
            .chain(cache.available.iter())
            .find(|candidate| candidate.shares_currency(requested))
            .cloned()
    }

    // ── Approval intake ──

    async fn on_approval(&mut self, ctx: &AgentContext, proposal: &TradeProposal) {
        if !self.seen.insert(proposal.id.clone()) {
            debug!(proposal = %proposal.id, "duplicate approval ignored");
            return;
        }
        if proposal.expired_at(Utc::now()) {
            // Too late to act; no execution event for this id.
            warn!(
                proposal = %proposal.id,
                deadline = %proposal.deadline(),
                "approval arrived after deadline, discarded"
            );
            return;
        }

        let mut proposal = proposal.clone();
        match self.resolve_symbol(&proposal.symbol) {
            Some(symbol) => {
                if symbol != proposal.symbol {
                    info!(
                        proposal = %proposal.id,
                        requested = %proposal.symbol,
                        substitute = %symbol,
                        "🔄 substituting unavailable symbol"
                    );
                    proposal.symbol = symbol;
                }
            }
            None => {
                warn!(
                    proposal = %proposal.id,
                    symbol = %proposal.symbol,
                    "no tradable fallback shares a currency, canceling"
                );
                self.emit_refusal(ctx, &proposal, TradeStatus::Canceled).await;
                return;
            }
        }

        self.pending
            .insert(proposal.id.clone(), PendingApproval { proposal });
    }

    /// Execution event for a proposal that never reached the gateway.
    async fn emit_refusal(&self, ctx: &AgentContext, proposal: &TradeProposal, status: TradeStatus) {
        ctx.send(Payload::TradeExecution(TradeExecution {
            proposal_id: proposal.id.clone(),
            execution_id: format!("exec-{}", Uuid::new_v4()),
            symbol: proposal.symbol.clone(),
            direction: proposal.direction,
            executed_size: 0.0,
            executed_price: 0.0,
            executed_at: Utc::now(),
            status,
            stop_loss: None,
            take_profit: None,
            strategy: proposal.strategy.clone(),
        }))
        .await;
    }

    // ── Order placement ──

    fn protective_prices(proposal: &TradeProposal, fill: f64) -> (Option<f64>, Option<f64>) {
        let pip = proposal.symbol.pip_size();
        let sign = match proposal.direction {
            Direction::Short => -1.0,
            _ => 1.0,
        };
        let stop = proposal.stop_loss_pips.map(|p| fill - sign * p * pip);
        let take = proposal.take_profit_pips.map(|p| fill + sign * p * pip);
        (stop, take)
    }

    async fn try_execute(&mut self, ctx: &AgentContext, id: &ProposalId) {
        let Some(pending) = self.pending.get(id) else { return };
        let proposal = pending.proposal.clone();

        let Some(quote) = self.gateway.current_price(&proposal.symbol).await else {
            debug!(proposal = %id, symbol = %proposal.symbol, "no quote yet");
            return;
        };
        let touch = quote.entry_price(proposal.direction);

        // Unfavourable-move guard: a worse price than the strategy intended
        // delays execution until the next tick.
        if let Some(intended) = proposal.entry_price {
            let deviation = (touch - intended).abs() / intended;
            if deviation > self.cfg.unfavorable_move_fraction {
                let worse = match proposal.direction {
                    Direction::Short => touch < intended,
                    _ => touch > intended,
                };
                if worse {
                    debug!(proposal = %id, touch, intended, "market moved unfavourably, delaying");
                    return;
                }
            }
        }

        let (stop_hint, take_hint) = Self::protective_prices(&proposal, touch);
        let request = OrderRequest {
            symbol: proposal.symbol.clone(),
            direction: proposal.direction,
            size: proposal.size,
            order_type: OrderType::Market,
            price: None,
            stop_loss: stop_hint,
            take_profit: take_hint,
        };

        match self.gateway.place_order(request).await {
            Ok(ack) => {
                let (stop_price, take_price) = Self::protective_prices(&proposal, ack.executed_price);
                if ack.executed_size < proposal.size {
                    info!(
                        proposal = %id,
                        requested = proposal.size,
                        filled = ack.executed_size,
                        "partial fill recorded, remainder not retried"
                    );
                }
                let execution = TradeExecution {
                    proposal_id: proposal.id.clone(),
                    execution_id: format!("exec-{}", Uuid::new_v4()),
                    symbol: proposal.symbol.clone(),
                    direction: proposal.direction,
                    executed_size: ack.executed_size,
                    executed_price: ack.executed_price,
                    executed_at: Utc::now(),
                    status: TradeStatus::Executed,
                    stop_loss: stop_price,
                    take_profit: take_price,
                    strategy: proposal.strategy.clone(),
                };
                info!(
                    proposal = %id,
                    execution = %execution.execution_id,
                    symbol = %execution.symbol,
                    price = execution.executed_price,
                    size = execution.executed_size,
                    "✅ order executed"
                );
                self.open.insert(
                    execution.execution_id.clone(),
                    OpenPosition {
                        execution: execution.clone(),
                        order_id: ack.order_id,
                        stop_price,
                        take_price,
                        hold_deadline: Instant::now()
                            + Duration::from_secs(self.cfg.default_hold_minutes * 60),
                    },
                );
                self.pending.remove(id);
                ctx.send(Payload::TradeExecution(execution)).await;
            }
            Err(err) if err.is_transient() => {
                warn!(proposal = %id, %err, "transient gateway failure, will retry");
            }
            Err(err) => {
                warn!(proposal = %id, %err, "❌ order refused, canceling proposal");
                self.emit_refusal(ctx, &proposal, TradeStatus::Canceled).await;
                self.pending.remove(id);
            }
        }
    }

    // ── Periodic work ──

    async fn expire_pending(&mut self, ctx: &AgentContext) {
        let now = Utc::now();
        let expired: Vec<ProposalId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.proposal.expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else { continue };
            info!(proposal = %id, "proposal expired before execution");
            self.emit_refusal(ctx, &pending.proposal, TradeStatus::Expired)
                .await;
        }
    }

    async fn retry_pending(&mut self, ctx: &AgentContext) {
        let ids: Vec<ProposalId> = self.pending.keys().cloned().collect();
        for id in ids {
            self.try_execute(ctx, &id).await;
        }
    }

    fn watch_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .availability
            .as_ref()
            .map(|c| c.available.clone())
            .unwrap_or_default();
        for position in self.open.values() {
            if !symbols.contains(&position.execution.symbol) {
                symbols.push(position.execution.symbol.clone());
            }
        }
        for pending in self.pending.values() {
            if !symbols.contains(&pending.proposal.symbol) {
                symbols.push(pending.proposal.symbol.clone());
            }
        }
        symbols
    }

    async fn publish_quotes(&self, ctx: &AgentContext) {
        for symbol in self.watch_symbols() {
            if let Some(quote) = self.gateway.current_price(&symbol).await {
                ctx.send(Payload::MarketData(MarketQuote {
                    symbol,
                    quote,
                    timestamp: Utc::now(),
                }))
                .await;
            }
        }
    }

    fn close_trigger(position: &OpenPosition, quote: Quote) -> Option<(CloseReason, f64)> {
        let exit = quote.exit_price(position.execution.direction);
        let long = position.execution.direction != Direction::Short;

        let stop_hit = position
            .stop_price
            .map(|stop| if long { exit <= stop } else { exit >= stop })
            .unwrap_or(false);
        let take_hit = position
            .take_price
            .map(|take| if long { exit >= take } else { exit <= take })
            .unwrap_or(false);

        // Stop wins when both trigger on the same tick.
        if stop_hit {
            Some((CloseReason::StopLoss, exit))
        } else if take_hit {
            Some((CloseReason::TakeProfit, exit))
        } else if Instant::now() >= position.hold_deadline {
            Some((CloseReason::Expiry, exit))
        } else {
            None
        }
    }

    async fn monitor_open(&mut self, ctx: &AgentContext) {
        let mut triggered: Vec<(ExecutionId, CloseReason)> = Vec::new();
        for (id, position) in &self.open {
            let Some(quote) = self.gateway.current_price(&position.execution.symbol).await
            else {
                continue;
            };
            if let Some((reason, _)) = Self::close_trigger(position, quote) {
                triggered.push((id.clone(), reason));
            }
        }
        for (id, reason) in triggered {
            self.close_position(ctx, &id, reason).await;
        }
    }

    async fn close_position(&mut self, ctx: &AgentContext, id: &ExecutionId, reason: CloseReason) {
        let Some(position) = self.open.get(id) else { return };
        let execution = position.execution.clone();
        let order_id = position.order_id.clone();

        let exit_price = match self
            .gateway
            .close_order(&execution.symbol, &order_id, execution.executed_size)
            .await
        {
            Ok(ack) => ack.executed_price,
            Err(err) if err.is_transient() && reason != CloseReason::Shutdown => {
                warn!(execution = %id, %err, "close failed, retrying next tick");
                return;
            }
            Err(err) => {
                // Best effort: account the close at the current quote.
                warn!(execution = %id, %err, "gateway close failed, recording at market");
                match self.gateway.current_price(&execution.symbol).await {
                    Some(quote) => quote.exit_price(execution.direction),
                    None => execution.executed_price,
                }
            }
        };

        self.open.remove(id);
        if !self.results_sent.insert(id.clone()) {
            debug!(execution = %id, "result already emitted, skipping");
            return;
        }

        let profit = execution.profit_at(exit_price);
        let pip = execution.symbol.pip_size();
        let profit_pips = match execution.direction {
            Direction::Short => (execution.executed_price - exit_price) / pip,
            _ => (exit_price - execution.executed_price) / pip,
        };
        info!(
            execution = %id,
            symbol = %execution.symbol,
            reason = ?reason,
            profit,
            profit_pips,
            "📋 position closed"
        );
        ctx.send(Payload::TradeResult(TradeResult {
            execution_id: execution.execution_id.clone(),
            proposal_id: execution.proposal_id.clone(),
            symbol: execution.symbol.clone(),
            direction: execution.direction,
            entry_price: execution.executed_price,
            exit_price,
            size: execution.executed_size,
            entered_at: execution.executed_at,
            exited_at: Utc::now(),
            profit,
            profit_pips,
            reason,
            strategy: execution.strategy.clone(),
        }))
        .await;
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[
            MessageKind::TradeApproval,
            MessageKind::TradeRejection,
            MessageKind::SystemStatus,
        ]);
        connect_with_backoff(self.gateway.as_ref(), 5)
            .await
            .map_err(|err: GatewayError| anyhow::anyhow!(err))?;
        info!(agent = %self.id, market = %self.cfg.market, "⚡ execution ready");
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        if self.availability_stale() {
            ctx.send_to(
                Payload::SystemStatus(SystemEvent::AssetAvailabilityRequest),
                vec![self.cfg.asset_selection_agent.clone()],
            )
            .await;
        }
        if self.cfg.publish_quotes {
            self.publish_quotes(ctx).await;
        }
        self.expire_pending(ctx).await;
        self.retry_pending(ctx).await;
        self.monitor_open(ctx).await;
        Ok(if self.pending.is_empty() && self.open.is_empty() {
            Activity::Idle
        } else {
            Activity::Busy
        })
    }

    async fn handle_message(
        &mut self,
        ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        match &message.payload {
            Payload::TradeApproval(approval) => {
                self.on_approval(ctx, &approval.proposal).await;
                // A quote is usually already there; do not wait a full tick.
                self.try_execute(ctx, &approval.proposal.id.clone()).await;
            }
            Payload::TradeRejection(rejection) => {
                debug!(proposal = %rejection.proposal_id, reason = %rejection.reason, "rejection noted");
                self.seen.insert(rejection.proposal_id.clone());
            }
            Payload::SystemStatus(SystemEvent::AssetAvailabilityUpdate {
                available,
                recommended,
            })
            | Payload::SystemStatus(SystemEvent::AssetAvailabilityResponse {
                available,
                recommended,
                ..
            }) => {
                self.cache_availability(available, recommended);
            }
            _ => {}
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &AgentContext) {
        let open: Vec<ExecutionId> = self.open.keys().cloned().collect();
        for id in open {
            self.close_position(ctx, &id, CloseReason::Shutdown).await;
        }
        self.gateway.disconnect().await;
    }
}
