//! Message envelope and the typed payload union.
//!
//! One `MessageKind` per payload variant; consumers pattern-match instead of
//! digging through dynamic maps. Envelopes are immutable after publish and
//! shared between inboxes as `Arc<Message>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    AgentId, CloseReason, Confidence, Direction, ExecutionId, IndicatorKind, ProposalId, Quote,
    Symbol, Timeframe, TradeStatus,
};

// ─────────────────────────────────────────────────────────
// Kinds
// ─────────────────────────────────────────────────────────

/// Closed set of message kinds routed by the broker. Subscriptions are keyed
/// by kind, so adding a variant means deciding who produces and consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SystemStatus,
    TechnicalSignal,
    FundamentalUpdate,
    MarketData,
    TradeProposal,
    TradeApproval,
    TradeRejection,
    RiskAssessment,
    RiskUpdate,
    TradeExecution,
    TradeResult,
    StrategyUpdate,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SystemStatus => "system_status",
            MessageKind::TechnicalSignal => "technical_signal",
            MessageKind::FundamentalUpdate => "fundamental_update",
            MessageKind::MarketData => "market_data",
            MessageKind::TradeProposal => "trade_proposal",
            MessageKind::TradeApproval => "trade_approval",
            MessageKind::TradeRejection => "trade_rejection",
            MessageKind::RiskAssessment => "risk_assessment",
            MessageKind::RiskUpdate => "risk_update",
            MessageKind::TradeExecution => "trade_execution",
            MessageKind::TradeResult => "trade_result",
            MessageKind::StrategyUpdate => "strategy_update",
            MessageKind::Error => "error",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Payload records
// ─────────────────────────────────────────────────────────

/// Directional hint from chart analysis. Consumed within a bounded freshness
/// window; stale signals are ignored by the strategy agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub indicator: IndicatorKind,
    pub direction: Direction,
    pub confidence: Confidence,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Macro event assessment from the fundamental agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalUpdate {
    pub currencies: Vec<String>,
    pub event: String,
    pub actual: Option<f64>,
    pub forecast: Option<f64>,
    pub previous: Option<f64>,
    pub impact: Direction,
    pub confidence: Confidence,
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book update for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: Symbol,
    pub quote: Quote,
    pub timestamp: DateTime<Utc>,
}

/// Requested trade awaiting risk review. Size may be a strategy default and
/// stops may be unset; the risk agent is authoritative on all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub id: ProposalId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub stop_loss_pips: Option<f64>,
    pub take_profit_pips: Option<f64>,
    pub time_limit_seconds: u64,
    pub strategy: String,
    pub technical_confidence: Confidence,
    pub fundamental_alignment: Confidence,
    pub risk_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of limits and context for a symbol, attached to approvals and
/// periodic risk updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub symbol: Symbol,
    pub max_position_size: f64,
    pub stop_loss_pips: f64,
    pub take_profit_pips: f64,
    pub max_daily_loss: f64,
    pub exposure: Vec<(Symbol, f64)>,
    pub volatility: f64,
}

/// Risk verdict: the proposal as the risk agent wants it executed, with size
/// possibly reduced and stops filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeApproval {
    pub proposal: TradeProposal,
    pub assessment: RiskAssessment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRejection {
    pub proposal_id: ProposalId,
    pub symbol: Symbol,
    pub reason: String,
}

/// Periodic account-level risk broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskUpdate {
    pub account_balance: f64,
    pub daily_pnl: f64,
    pub exposure: Vec<(Symbol, f64)>,
    pub timestamp: DateTime<Utc>,
}

/// Record of an order placed with (or refused by) the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    pub proposal_id: ProposalId,
    pub execution_id: ExecutionId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub executed_size: f64,
    pub executed_price: f64,
    pub executed_at: DateTime<Utc>,
    pub status: TradeStatus,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: String,
}

/// Outcome accounting of a closed position. Exactly one per execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub execution_id: ExecutionId,
    pub proposal_id: ProposalId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub profit: f64,
    pub profit_pips: f64,
    pub reason: CloseReason,
    pub strategy: String,
}

/// Strategy parameter change broadcast after an optimisation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub strategy: String,
    pub confidence_threshold: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub timestamp: DateTime<Utc>,
}

/// System-level event. Closed enum: availability flows between asset
/// selection and execution, alerts come from the risk circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    AssetAvailabilityUpdate {
        available: Vec<Symbol>,
        recommended: Vec<Symbol>,
    },
    AssetAvailabilityRequest,
    AssetAvailabilityResponse {
        available: Vec<Symbol>,
        recommended: Vec<Symbol>,
        details: Vec<(Symbol, bool)>,
    },
    RiskAlert {
        reason: String,
    },
    AgentStopped {
        agent: AgentId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub agent: AgentId,
    pub context: String,
    pub detail: String,
}

// ─────────────────────────────────────────────────────────
// Tagged union + envelope
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    SystemStatus(SystemEvent),
    TechnicalSignal(TechnicalSignal),
    FundamentalUpdate(FundamentalUpdate),
    MarketData(MarketQuote),
    TradeProposal(TradeProposal),
    TradeApproval(TradeApproval),
    TradeRejection(TradeRejection),
    RiskAssessment(RiskAssessment),
    RiskUpdate(RiskUpdate),
    TradeExecution(TradeExecution),
    TradeResult(TradeResult),
    StrategyUpdate(StrategyUpdate),
    Error(ErrorReport),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::SystemStatus(_) => MessageKind::SystemStatus,
            Payload::TechnicalSignal(_) => MessageKind::TechnicalSignal,
            Payload::FundamentalUpdate(_) => MessageKind::FundamentalUpdate,
            Payload::MarketData(_) => MessageKind::MarketData,
            Payload::TradeProposal(_) => MessageKind::TradeProposal,
            Payload::TradeApproval(_) => MessageKind::TradeApproval,
            Payload::TradeRejection(_) => MessageKind::TradeRejection,
            Payload::RiskAssessment(_) => MessageKind::RiskAssessment,
            Payload::RiskUpdate(_) => MessageKind::RiskUpdate,
            Payload::TradeExecution(_) => MessageKind::TradeExecution,
            Payload::TradeResult(_) => MessageKind::TradeResult,
            Payload::StrategyUpdate(_) => MessageKind::StrategyUpdate,
            Payload::Error(_) => MessageKind::Error,
        }
    }
}

/// Broker-assigned message id. Opaque to agents; the decimal zero-padding
/// keeps string order equal to assignment order.
pub type MessageId = String;

/// Immutable envelope carrying one payload between agents. An empty
/// `recipients` list means broadcast to every subscriber of the kind except
/// the sender; a non-empty list means direct delivery to those ids only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub sender: AgentId,
    pub recipients: Vec<AgentId>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build an envelope ready for publish. The id is empty until the broker
    /// assigns one; the kind is derived from the payload, never passed in.
    pub fn new(sender: impl Into<AgentId>, payload: Payload, recipients: Vec<AgentId>) -> Message {
        Message {
            id: MessageId::new(),
            kind: payload.kind(),
            sender: sender.into(),
            recipients,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(sender: impl Into<AgentId>, payload: Payload) -> Message {
        Message::new(sender, payload, Vec::new())
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipients.is_empty()
    }
}

impl TradeProposal {
    /// Deadline for execution, measured from the creation timestamp stamped
    /// by the strategy agent.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.time_limit_seconds as i64)
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline()
    }
}

impl TradeExecution {
    /// Signed profit for a hypothetical exit at `exit_price`.
    pub fn profit_at(&self, exit_price: f64) -> f64 {
        match self.direction {
            Direction::Short => self.executed_size * (self.executed_price - exit_price),
            _ => self.executed_size * (exit_price - self.executed_price),
        }
    }
}
