//! Risk management agent.
//!
//! Sole authority on proposal size and protective stops. Every proposal is
//! checked against the daily-loss cap, the per-trade risk fraction, symbol
//! exposure, observed volatility and proximity to high-impact fundamental
//! events; the verdict goes out as `trade_approval` with an adjusted
//! proposal or `trade_rejection` with a reason. A periodic pass broadcasts
//! account-level risk and fires the daily-loss circuit breaker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{
    Message, MessageKind, Payload, RiskAssessment, RiskUpdate, SystemEvent, TradeApproval,
    TradeProposal, TradeRejection,
};
use crate::fabric::types::{ProposalId, Symbol, TradeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub update_interval_secs: u64,
    /// Largest loss a single trade may risk, as a fraction of the account.
    pub max_trade_risk_fraction: f64,
    /// Exposure ceiling per symbol, in units as a multiple of the account
    /// balance (leveraged positions are larger than the account).
    pub max_position_fraction: f64,
    /// Daily loss that trips the circuit breaker, as a fraction.
    pub max_daily_loss_fraction: f64,
    pub starting_balance: f64,
    /// Volatility (EW absolute return) above which size is halved.
    pub volatility_threshold: f64,
    /// Reject proposals this close to a released high-impact event.
    pub event_blackout_secs: u64,
    pub min_size: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            max_trade_risk_fraction: 0.02,
            max_position_fraction: 2.0,
            max_daily_loss_fraction: 0.05,
            starting_balance: 10_000.0,
            volatility_threshold: 0.004,
            event_blackout_secs: 300,
            min_size: 100.0,
        }
    }
}

impl RiskConfig {
    /// Environment overrides, `FXSWARM_RISK_*`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("FXSWARM_RISK_MAX_TRADE_RISK") {
            if let Ok(f) = v.parse() {
                cfg.max_trade_risk_fraction = f;
            }
        }
        if let Ok(v) = std::env::var("FXSWARM_RISK_MAX_DAILY_LOSS") {
            if let Ok(f) = v.parse() {
                cfg.max_daily_loss_fraction = f;
            }
        }
        if let Ok(v) = std::env::var("FXSWARM_RISK_BALANCE") {
            if let Ok(f) = v.parse() {
                cfg.starting_balance = f;
            }
        }
        cfg
    }
}

struct VolatilityTracker {
    last_mid: f64,
    /// Exponentially weighted absolute return.
    ew_abs_return: f64,
}

pub struct RiskAgent {
    id: String,
    cfg: RiskConfig,
    gate: PeriodicGate,
    balance: f64,
    daily_pnl: f64,
    day: NaiveDate,
    alerted: bool,
    /// Net open size per symbol, fed by executions and results.
    open_positions: HashMap<Symbol, f64>,
    volatility: HashMap<Symbol, VolatilityTracker>,
    /// Released high-impact events: affected currencies + when.
    blackout_events: Vec<(Vec<String>, Instant)>,
    /// Proposals already decided; repeats of the same id are ignored.
    decided: HashSet<ProposalId>,
    statuses: HashMap<ProposalId, TradeStatus>,
}

impl RiskAgent {
    pub fn new(id: impl Into<String>, cfg: RiskConfig) -> RiskAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.update_interval_secs));
        RiskAgent {
            id: id.into(),
            balance: cfg.starting_balance,
            cfg,
            gate,
            daily_pnl: 0.0,
            day: Utc::now().date_naive(),
            alerted: false,
            open_positions: HashMap::new(),
            volatility: HashMap::new(),
            blackout_events: Vec::new(),
            decided: HashSet::new(),
            statuses: HashMap::new(),
        }
    }

    pub fn proposal_status(&self, id: &str) -> Option<TradeStatus> {
        self.statuses.get(id).copied()
    }

    fn daily_loss_cap(&self) -> f64 {
        self.cfg.max_daily_loss_fraction * self.balance
    }

    fn exposure(&self, symbol: &Symbol) -> f64 {
        self.open_positions.get(symbol).copied().unwrap_or(0.0)
    }

    fn exposure_map(&self) -> Vec<(Symbol, f64)> {
        let mut exposure: Vec<(Symbol, f64)> = self
            .open_positions
            .iter()
            .filter(|(_, size)| size.abs() > f64::EPSILON)
            .map(|(s, size)| (s.clone(), *size))
            .collect();
        exposure.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        exposure
    }

    fn volatility_of(&self, symbol: &Symbol) -> f64 {
        self.volatility
            .get(symbol)
            .map(|t| t.ew_abs_return)
            .unwrap_or(0.0)
    }

    fn in_event_blackout(&self, symbol: &Symbol) -> bool {
        let window = Duration::from_secs(self.cfg.event_blackout_secs);
        self.blackout_events.iter().any(|(currencies, at)| {
            at.elapsed() < window
                && currencies
                    .iter()
                    .any(|c| c == symbol.base() || c == symbol.quote())
        })
    }

    /// Potential loss if the stop is hit, in account currency.
    fn potential_loss(&self, proposal: &TradeProposal) -> f64 {
        match proposal.stop_loss_pips {
            Some(pips) => proposal.size * proposal.symbol.pips_to_price(pips),
            // No stop given: assume one percent adverse move.
            None => proposal.size * 0.01,
        }
    }

    /// The full gauntlet. Returns an adjusted proposal or a reason string.
    fn evaluate(&self, proposal: &TradeProposal) -> Result<TradeProposal, String> {
        if self.daily_pnl <= -self.daily_loss_cap() {
            return Err("daily loss cap".into());
        }
        if self.in_event_blackout(&proposal.symbol) {
            return Err("high-impact event blackout".into());
        }

        let mut adjusted = proposal.clone();
        if adjusted.stop_loss_pips.is_none() {
            adjusted.stop_loss_pips = Some(50.0);
        }
        if adjusted.take_profit_pips.is_none() {
            adjusted.take_profit_pips = Some(100.0);
        }

        // Scale down until the stop-out loss fits the per-trade budget.
        let loss = self.potential_loss(&adjusted);
        let budget = self.cfg.max_trade_risk_fraction * self.balance;
        if loss > budget {
            adjusted.size *= budget / loss;
            debug!(
                proposal = %adjusted.id,
                size = adjusted.size,
                "size reduced to fit risk budget"
            );
        }

        // Symbol exposure ceiling.
        let cap = self.cfg.max_position_fraction * self.balance;
        let headroom = cap - self.exposure(&adjusted.symbol).abs();
        if headroom <= 0.0 {
            return Err(format!("maximum exposure for {} reached", adjusted.symbol));
        }
        if adjusted.size > headroom {
            adjusted.size = headroom;
        }

        // High volatility halves whatever is left.
        if self.volatility_of(&adjusted.symbol) > self.cfg.volatility_threshold {
            adjusted.size *= 0.5;
        }

        if adjusted.size < self.cfg.min_size {
            return Err("position size too small after risk adjustment".into());
        }
        Ok(adjusted)
    }

    fn assessment_for(&self, proposal: &TradeProposal) -> RiskAssessment {
        RiskAssessment {
            symbol: proposal.symbol.clone(),
            max_position_size: proposal.size,
            stop_loss_pips: proposal.stop_loss_pips.unwrap_or(50.0),
            take_profit_pips: proposal.take_profit_pips.unwrap_or(100.0),
            max_daily_loss: self.daily_loss_cap(),
            exposure: self.exposure_map(),
            volatility: self.volatility_of(&proposal.symbol),
        }
    }

    async fn decide(&mut self, ctx: &AgentContext, proposal: &TradeProposal) {
        if !self.decided.insert(proposal.id.clone()) {
            debug!(proposal = %proposal.id, "duplicate proposal ignored");
            return;
        }
        self.statuses
            .insert(proposal.id.clone(), TradeStatus::Proposed);

        match self.evaluate(proposal) {
            Ok(adjusted) => {
                info!(
                    proposal = %adjusted.id,
                    symbol = %adjusted.symbol,
                    size = adjusted.size,
                    "✅ proposal approved"
                );
                self.statuses
                    .insert(adjusted.id.clone(), TradeStatus::Approved);
                let assessment = self.assessment_for(&adjusted);
                ctx.send(Payload::TradeApproval(TradeApproval {
                    proposal: adjusted,
                    assessment,
                }))
                .await;
            }
            Err(reason) => {
                warn!(proposal = %proposal.id, %reason, "🚫 proposal rejected");
                self.statuses
                    .insert(proposal.id.clone(), TradeStatus::Rejected);
                ctx.send(Payload::TradeRejection(TradeRejection {
                    proposal_id: proposal.id.clone(),
                    symbol: proposal.symbol.clone(),
                    reason,
                }))
                .await;
            }
        }
    }

    fn update_volatility(&mut self, symbol: &Symbol, mid: f64) {
        match self.volatility.get_mut(symbol) {
            Some(tracker) => {
                if tracker.last_mid > 0.0 {
                    let ret = ((mid - tracker.last_mid) / tracker.last_mid).abs();
                    tracker.ew_abs_return = 0.9 * tracker.ew_abs_return + 0.1 * ret;
                }
                tracker.last_mid = mid;
            }
            None => {
                self.volatility.insert(
                    symbol.clone(),
                    VolatilityTracker {
                        last_mid: mid,
                        ew_abs_return: 0.0,
                    },
                );
            }
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            info!(pnl = self.daily_pnl, "daily P&L reset");
            self.day = today;
            self.daily_pnl = 0.0;
            self.alerted = false;
        }
    }

    async fn periodic(&mut self, ctx: &AgentContext) {
        self.roll_day();
        ctx.send(Payload::RiskUpdate(RiskUpdate {
            account_balance: self.balance,
            daily_pnl: self.daily_pnl,
            exposure: self.exposure_map(),
            timestamp: Utc::now(),
        }))
        .await;

        if self.daily_pnl <= -self.daily_loss_cap() && !self.alerted {
            self.alerted = true;
            warn!(pnl = self.daily_pnl, cap = self.daily_loss_cap(), "☠️ daily loss cap breached");
            ctx.send(Payload::SystemStatus(SystemEvent::RiskAlert {
                reason: "daily loss cap breached".into(),
            }))
            .await;
        }
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[
            MessageKind::TradeProposal,
            MessageKind::TradeExecution,
            MessageKind::TradeResult,
            MessageKind::MarketData,
            MessageKind::FundamentalUpdate,
            MessageKind::SystemStatus,
        ]);
        info!(agent = %self.id, balance = self.balance, "risk management ready");
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        self.periodic(ctx).await;
        Ok(Activity::Busy)
    }

    async fn handle_message(
        &mut self,
        ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        match &message.payload {
            Payload::TradeProposal(proposal) => self.decide(ctx, proposal).await,
            Payload::TradeExecution(execution) if execution.status == TradeStatus::Executed => {
                *self
                    .open_positions
                    .entry(execution.symbol.clone())
                    .or_insert(0.0) += execution.executed_size;
                self.statuses
                    .insert(execution.proposal_id.clone(), TradeStatus::Executed);
            }
            Payload::TradeResult(result) => {
                self.daily_pnl += result.profit;
                if let Some(size) = self.open_positions.get_mut(&result.symbol) {
                    *size -= result.size;
                    if size.abs() <= f64::EPSILON {
                        self.open_positions.remove(&result.symbol);
                    }
                }
                self.statuses
                    .insert(result.proposal_id.clone(), TradeStatus::Closed);
            }
            Payload::MarketData(quote) => {
                self.update_volatility(&quote.symbol, quote.quote.mid());
            }
            Payload::FundamentalUpdate(update) => {
                if update.confidence >= crate::fabric::types::Confidence::High {
                    self.blackout_events
                        .push((update.currencies.clone(), Instant::now()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
