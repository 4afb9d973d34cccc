//! Strategy agent.
//!
//! Caches fresh technical signals and fundamental updates, and periodically
//! looks for confluence: enough agreeing evidence on one symbol to justify a
//! trade proposal. Proposal status is tracked locally and only ever advances
//! along the legal state machine; results feed a per-strategy performance
//! ledger that nudges the confluence threshold and is persisted as JSON.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{
    FundamentalUpdate, Message, MessageKind, Payload, StrategyUpdate, TechnicalSignal,
    TradeProposal,
};
use crate::fabric::types::{Confidence, Direction, IndicatorKind, ProposalId, Symbol, TradeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub update_interval_secs: u64,
    /// Signals older than this no longer count toward confluence.
    pub signal_freshness_secs: u64,
    /// Starting confluence threshold for every strategy label.
    pub min_confluence: f64,
    pub default_size: f64,
    pub default_stop_pips: f64,
    pub default_take_pips: f64,
    pub proposal_time_limit_secs: u64,
    pub max_open_proposals: usize,
    /// Step applied to a strategy's threshold when its win rate drifts.
    pub learning_rate: f64,
    /// Performance snapshot location. `None` disables persistence.
    pub state_file: Option<PathBuf>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 30,
            signal_freshness_secs: 300,
            min_confluence: 0.6,
            default_size: 10_000.0,
            default_stop_pips: 50.0,
            default_take_pips: 100.0,
            proposal_time_limit_secs: 3600,
            max_open_proposals: 3,
            learning_rate: 0.05,
            state_file: None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Performance ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub trades: u32,
    pub wins: u32,
    pub gross_win: f64,
    pub gross_loss: f64,
    pub confidence_threshold: f64,
}

impl StrategyPerformance {
    fn new(threshold: f64) -> StrategyPerformance {
        StrategyPerformance {
            trades: 0,
            wins: 0,
            gross_win: 0.0,
            gross_loss: 0.0,
            confidence_threshold: threshold,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.5
        } else {
            self.wins as f64 / self.trades as f64
        }
    }

    pub fn profit_factor(&self) -> f64 {
        if self.gross_loss <= f64::EPSILON {
            if self.gross_win > 0.0 {
                f64::INFINITY
            } else {
                1.0
            }
        } else {
            self.gross_win / self.gross_loss
        }
    }

    fn record(&mut self, profit: f64) {
        self.trades += 1;
        if profit > 0.0 {
            self.wins += 1;
            self.gross_win += profit;
        } else {
            self.gross_loss += -profit;
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PerformanceSnapshot {
    strategies: HashMap<String, StrategyPerformance>,
}

fn strategy_label(indicator: IndicatorKind) -> &'static str {
    match indicator {
        IndicatorKind::AverageCross => "trend_following",
        IndicatorKind::Momentum => "momentum",
        IndicatorKind::Volatility => "breakout",
    }
}

// ─────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────

pub struct StrategyAgent {
    id: String,
    cfg: StrategyConfig,
    gate: PeriodicGate,
    /// Latest signal per (symbol, indicator).
    signals: HashMap<Symbol, HashMap<IndicatorKind, (TechnicalSignal, Instant)>>,
    fundamentals: Vec<(FundamentalUpdate, Instant)>,
    /// Local view of every proposal this agent originated.
    statuses: HashMap<ProposalId, TradeStatus>,
    proposal_symbols: HashMap<ProposalId, Symbol>,
    performance: HashMap<String, StrategyPerformance>,
    dirty: bool,
}

impl StrategyAgent {
    pub fn new(id: impl Into<String>, cfg: StrategyConfig) -> StrategyAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.update_interval_secs));
        StrategyAgent {
            id: id.into(),
            cfg,
            gate,
            signals: HashMap::new(),
            fundamentals: Vec::new(),
            statuses: HashMap::new(),
            proposal_symbols: HashMap::new(),
            performance: HashMap::new(),
            dirty: false,
        }
    }

    pub fn proposal_status(&self, id: &str) -> Option<TradeStatus> {
        self.statuses.get(id).copied()
    }

    /// Advance a tracked proposal, refusing anything the state machine does
    /// not allow. Unknown ids and illegal jumps are dropped with a log.
    fn advance(&mut self, id: &str, next: TradeStatus) {
        match self.statuses.get_mut(id) {
            None => debug!(proposal = id, next = ?next, "status for unknown proposal dropped"),
            Some(current) if current.can_advance(next) => {
                debug!(proposal = id, from = ?current, to = ?next, "proposal advanced");
                *current = next;
            }
            Some(current) => {
                debug!(proposal = id, from = ?current, to = ?next, "illegal transition dropped")
            }
        }
    }

    fn open_proposals(&self) -> usize {
        self.statuses.values().filter(|s| !s.is_terminal()).count()
    }

    fn has_open_on(&self, symbol: &Symbol) -> bool {
        self.proposal_symbols.iter().any(|(id, s)| {
            s == symbol
                && self
                    .statuses
                    .get(id)
                    .map(|status| !status.is_terminal())
                    .unwrap_or(false)
        })
    }

    fn prune(&mut self) {
        let freshness = Duration::from_secs(self.cfg.signal_freshness_secs);
        for per_symbol in self.signals.values_mut() {
            per_symbol.retain(|_, (_, at)| at.elapsed() < freshness);
        }
        self.signals.retain(|_, per_symbol| !per_symbol.is_empty());
        self.fundamentals.retain(|(_, at)| at.elapsed() < freshness);
    }

    /// Weighted agreement across fresh signals for one symbol, plus half
    /// weight from fundamentals touching either leg. Positive is long.
    fn confluence(&self, symbol: &Symbol) -> Option<(f64, IndicatorKind, Confidence)> {
        let per_symbol = self.signals.get(symbol)?;
        let mut score = 0.0;
        let mut strongest: Option<(f64, IndicatorKind)> = None;
        for (indicator, (signal, _)) in per_symbol {
            let weight = signal.confidence.score();
            let signed = match signal.direction {
                Direction::Long => weight,
                Direction::Short => -weight,
                Direction::Neutral => 0.0,
            };
            score += signed;
            if strongest.map(|(w, _)| weight > w).unwrap_or(true) {
                strongest = Some((weight, *indicator));
            }
        }

        let mut alignment = 0.0;
        for (update, _) in &self.fundamentals {
            let touches = update
                .currencies
                .iter()
                .any(|c| c == symbol.base() || c == symbol.quote());
            if !touches {
                continue;
            }
            // A strengthening quote currency pushes the pair down.
            let orientation = if update.currencies.iter().any(|c| c == symbol.base()) {
                1.0
            } else {
                -1.0
            };
            let signed = match update.impact {
                Direction::Long => update.confidence.score(),
                Direction::Short => -update.confidence.score(),
                Direction::Neutral => 0.0,
            };
            alignment += orientation * signed * 0.5;
        }

        let (_, indicator) = strongest?;
        let alignment_confidence = Confidence::from_score(alignment.abs().min(1.0));
        Some((score + alignment, indicator, alignment_confidence))
    }

    fn threshold_for(&mut self, label: &str) -> f64 {
        let default = self.cfg.min_confluence;
        self.performance
            .entry(label.to_string())
            .or_insert_with(|| StrategyPerformance::new(default))
            .confidence_threshold
    }

    async fn evaluate_opportunities(&mut self, ctx: &AgentContext) -> bool {
        self.prune();
        let symbols: Vec<Symbol> = self.signals.keys().cloned().collect();
        let mut proposed = false;
        for symbol in symbols {
            if self.open_proposals() >= self.cfg.max_open_proposals {
                break;
            }
            if self.has_open_on(&symbol) {
                continue;
            }
            let Some((score, indicator, alignment)) = self.confluence(&symbol) else {
                continue;
            };
            let label = strategy_label(indicator);
            let threshold = self.threshold_for(label);
            if score.abs() < threshold {
                continue;
            }
            let direction = if score > 0.0 {
                Direction::Long
            } else {
                Direction::Short
            };
            let proposal = TradeProposal {
                id: Uuid::new_v4().to_string(),
                symbol: symbol.clone(),
                direction,
                size: self.cfg.default_size,
                entry_price: None,
                stop_loss_pips: Some(self.cfg.default_stop_pips),
                take_profit_pips: Some(self.cfg.default_take_pips),
                time_limit_seconds: self.cfg.proposal_time_limit_secs,
                strategy: label.to_string(),
                technical_confidence: Confidence::from_score(score.abs().min(1.0)),
                fundamental_alignment: alignment,
                risk_score: (1.0 - score.abs()).clamp(0.0, 1.0),
                created_at: Utc::now(),
            };
            info!(
                proposal = %proposal.id,
                symbol = %symbol,
                direction = direction.as_str(),
                score,
                strategy = label,
                "📤 proposing trade"
            );
            self.statuses
                .insert(proposal.id.clone(), TradeStatus::Proposed);
            self.proposal_symbols.insert(proposal.id.clone(), symbol);
            ctx.send(Payload::TradeProposal(proposal)).await;
            proposed = true;
        }
        proposed
    }

    async fn fold_result(&mut self, ctx: &AgentContext, strategy: &str, profit: f64) {
        let default = self.cfg.min_confluence;
        let perf = self
            .performance
            .entry(strategy.to_string())
            .or_insert_with(|| StrategyPerformance::new(default));
        perf.record(profit);
        self.dirty = true;

        // Tune selectivity once there is a sample worth reading: a losing
        // strategy must see stronger confluence, a winning one may loosen.
        if perf.trades >= 5 {
            let rate = perf.win_rate();
            let step = self.cfg.learning_rate;
            if rate < 0.4 {
                perf.confidence_threshold = (perf.confidence_threshold + step).min(0.9);
            } else if rate > 0.6 {
                perf.confidence_threshold = (perf.confidence_threshold - step).max(0.3);
            }
        }

        let snapshot = perf.clone();
        ctx.send(Payload::StrategyUpdate(StrategyUpdate {
            strategy: strategy.to_string(),
            confidence_threshold: snapshot.confidence_threshold,
            win_rate: snapshot.win_rate(),
            profit_factor: snapshot.profit_factor(),
            timestamp: Utc::now(),
        }))
        .await;
    }

    // ── Persistence ──

    fn load_snapshot(&mut self) {
        let Some(path) = &self.cfg.state_file else { return };
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_slice::<PerformanceSnapshot>(&raw) {
            Ok(snapshot) => {
                info!(strategies = snapshot.strategies.len(), "performance snapshot loaded");
                self.performance = snapshot.strategies;
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "corrupt snapshot discarded, starting fresh");
            }
        }
    }

    fn save_snapshot(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(path) = &self.cfg.state_file else { return };
        let snapshot = PerformanceSnapshot {
            strategies: self.performance.clone(),
        };
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(path, bytes) {
                    warn!(%err, path = %path.display(), "failed to persist snapshot");
                } else {
                    self.dirty = false;
                }
            }
            Err(err) => warn!(%err, "failed to serialise snapshot"),
        }
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[
            MessageKind::TechnicalSignal,
            MessageKind::FundamentalUpdate,
            MessageKind::TradeApproval,
            MessageKind::TradeRejection,
            MessageKind::TradeExecution,
            MessageKind::TradeResult,
            MessageKind::SystemStatus,
        ]);
        self.load_snapshot();
        info!(agent = %self.id, "strategy ready");
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        let proposed = self.evaluate_opportunities(ctx).await;
        self.save_snapshot();
        Ok(if proposed { Activity::Busy } else { Activity::Idle })
    }

    async fn handle_message(
        &mut self,
        ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        match &message.payload {
            Payload::TechnicalSignal(signal) => {
                self.signals
                    .entry(signal.symbol.clone())
                    .or_default()
                    .insert(signal.indicator, (signal.clone(), Instant::now()));
            }
            Payload::FundamentalUpdate(update) => {
                self.fundamentals.push((update.clone(), Instant::now()));
            }
            Payload::TradeApproval(approval) => {
                self.advance(&approval.proposal.id, TradeStatus::Approved);
            }
            Payload::TradeRejection(rejection) => {
                self.advance(&rejection.proposal_id, TradeStatus::Rejected);
            }
            Payload::TradeExecution(execution) => {
                self.advance(&execution.proposal_id, execution.status);
            }
            Payload::TradeResult(result) => {
                self.advance(&result.proposal_id, TradeStatus::Closed);
                self.fold_result(ctx, &result.strategy, result.profit).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &AgentContext) {
        self.save_snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(symbol: &str, indicator: IndicatorKind, direction: Direction, confidence: Confidence) -> TechnicalSignal {
        TechnicalSignal {
            symbol: Symbol::from(symbol),
            timeframe: crate::fabric::types::Timeframe::H1,
            indicator,
            direction,
            confidence,
            value: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn agent() -> StrategyAgent {
        StrategyAgent::new("strategy", StrategyConfig::default())
    }

    fn cache(agent: &mut StrategyAgent, s: TechnicalSignal) {
        agent
            .signals
            .entry(s.symbol.clone())
            .or_default()
            .insert(s.indicator, (s, Instant::now()));
    }

    #[test]
    fn confluence_adds_agreeing_signals() {
        let mut a = agent();
        cache(&mut a, signal("EUR/USD", IndicatorKind::AverageCross, Direction::Long, Confidence::High));
        cache(&mut a, signal("EUR/USD", IndicatorKind::Momentum, Direction::Long, Confidence::Medium));
        let (score, _, _) = a.confluence(&Symbol::from("EUR/USD")).unwrap();
        assert!((score - 1.25).abs() < 1e-9);
    }

    #[test]
    fn conflicting_signals_cancel() {
        let mut a = agent();
        cache(&mut a, signal("EUR/USD", IndicatorKind::AverageCross, Direction::Long, Confidence::High));
        cache(&mut a, signal("EUR/USD", IndicatorKind::Momentum, Direction::Short, Confidence::High));
        let (score, _, _) = a.confluence(&Symbol::from("EUR/USD")).unwrap();
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn fundamental_on_quote_currency_pushes_pair_down() {
        let mut a = agent();
        cache(&mut a, signal("EUR/USD", IndicatorKind::AverageCross, Direction::Long, Confidence::Medium));
        a.fundamentals.push((
            FundamentalUpdate {
                currencies: vec!["USD".into()],
                event: "NFP".into(),
                actual: Some(1.0),
                forecast: Some(0.5),
                previous: None,
                impact: Direction::Long,
                confidence: Confidence::High,
                timestamp: Utc::now(),
            },
            Instant::now(),
        ));
        let (score, _, _) = a.confluence(&Symbol::from("EUR/USD")).unwrap();
        // 0.5 from the signal, minus 0.375 from the strong-dollar event.
        assert!((score - 0.125).abs() < 1e-9);
    }

    #[test]
    fn status_tracking_is_monotonic() {
        let mut a = agent();
        a.statuses.insert("p1".into(), TradeStatus::Proposed);
        a.advance("p1", TradeStatus::Approved);
        a.advance("p1", TradeStatus::Executed);
        assert_eq!(a.proposal_status("p1"), Some(TradeStatus::Executed));

        // Illegal and unknown transitions are dropped.
        a.advance("p1", TradeStatus::Approved);
        assert_eq!(a.proposal_status("p1"), Some(TradeStatus::Executed));
        a.advance("ghost", TradeStatus::Closed);
        assert_eq!(a.proposal_status("ghost"), None);

        a.advance("p1", TradeStatus::Closed);
        assert_eq!(a.proposal_status("p1"), Some(TradeStatus::Closed));
    }

    #[test]
    fn losing_streak_raises_threshold() {
        let mut a = agent();
        let before = a.threshold_for("trend_following");
        let perf = a.performance.get_mut("trend_following").unwrap();
        for _ in 0..6 {
            perf.record(-10.0);
        }
        let rate = perf.win_rate();
        assert!(rate < 0.4);
        // Apply the same adjustment fold_result would.
        perf.confidence_threshold = (perf.confidence_threshold + a.cfg.learning_rate).min(0.9);
        assert!(a.performance["trend_following"].confidence_threshold > before);
    }

    #[test]
    fn corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let mut a = StrategyAgent::new(
            "strategy",
            StrategyConfig {
                state_file: Some(path.clone()),
                ..StrategyConfig::default()
            },
        );
        a.load_snapshot();
        assert!(a.performance.is_empty(), "corrupt file must reset to defaults");
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.json");

        let mut a = StrategyAgent::new(
            "strategy",
            StrategyConfig {
                state_file: Some(path.clone()),
                ..StrategyConfig::default()
            },
        );
        a.threshold_for("momentum");
        a.performance.get_mut("momentum").unwrap().record(25.0);
        a.dirty = true;
        a.save_snapshot();

        let mut b = StrategyAgent::new(
            "strategy",
            StrategyConfig {
                state_file: Some(path),
                ..StrategyConfig::default()
            },
        );
        b.load_snapshot();
        assert_eq!(b.performance["momentum"].trades, 1);
        assert_eq!(b.performance["momentum"].wins, 1);
    }

    #[test]
    fn profit_factor_handles_no_losses() {
        let mut perf = StrategyPerformance::new(0.6);
        perf.record(10.0);
        assert!(perf.profit_factor().is_infinite());
        perf.record(-5.0);
        assert!((perf.profit_factor() - 2.0).abs() < 1e-9);
    }
}
