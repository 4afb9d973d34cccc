//! Shared value types used on the wire between agents.
//!
//! Everything here is a closed enum or a small copyable record. Free-form
//! strings never carry semantics: direction, confidence, status and timeframe
//! are all typed, and cross-agent correlation happens through ids.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────

/// Stable identifier of a registered agent ("strategy", "risk", ...).
pub type AgentId = String;

/// Correlation id of a trade proposal, carried by every message in the
/// proposal's lifecycle.
pub type ProposalId = String;

/// Identifier of a filled order, assigned by the execution agent.
pub type ExecutionId = String;

// ─────────────────────────────────────────────────────────
// Direction / confidence
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Neutral => "neutral",
        }
    }
}

/// Confidence grade attached to signals and proposals. Ordered, so
/// `confidence >= Confidence::High` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Confidence {
    /// Numeric weight in (0, 1] for confluence scoring.
    pub fn score(&self) -> f64 {
        match self {
            Confidence::Low => 0.25,
            Confidence::Medium => 0.5,
            Confidence::High => 0.75,
            Confidence::VeryHigh => 1.0,
        }
    }

    pub fn from_score(score: f64) -> Confidence {
        if score >= 0.875 {
            Confidence::VeryHigh
        } else if score >= 0.625 {
            Confidence::High
        } else if score >= 0.375 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

/// Indicator family that produced a technical signal. The concrete math
/// lives with the technical agent; consumers only branch on the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    AverageCross,
    Momentum,
    Volatility,
}

// ─────────────────────────────────────────────────────────
// Trade status state machine
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a proposal. The status itself is never mutated on a
/// shared record: each transition is a new message, and every agent tracks
/// the latest status in its own map keyed by proposal id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Proposed,
    Approved,
    Rejected,
    Executed,
    Canceled,
    Expired,
    Closed,
}

impl TradeStatus {
    /// Position along the total order
    /// `proposed < approved|rejected < executed|expired|canceled < closed`.
    pub fn rank(&self) -> u8 {
        match self {
            TradeStatus::Proposed => 0,
            TradeStatus::Approved | TradeStatus::Rejected => 1,
            TradeStatus::Executed | TradeStatus::Expired | TradeStatus::Canceled => 2,
            TradeStatus::Closed => 3,
        }
    }

    /// Whether `next` is a legal successor. Rank must strictly increase, and
    /// the terminal branches never converge: a rejected proposal cannot be
    /// executed, and only an executed trade can close.
    pub fn can_advance(&self, next: TradeStatus) -> bool {
        if next.rank() <= self.rank() {
            return false;
        }
        match (self, next) {
            (TradeStatus::Proposed, TradeStatus::Approved | TradeStatus::Rejected) => true,
            (TradeStatus::Proposed, TradeStatus::Expired | TradeStatus::Canceled) => true,
            (
                TradeStatus::Approved,
                TradeStatus::Executed | TradeStatus::Expired | TradeStatus::Canceled,
            ) => true,
            (TradeStatus::Executed, TradeStatus::Closed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Rejected
                | TradeStatus::Expired
                | TradeStatus::Canceled
                | TradeStatus::Closed
        )
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Expiry,
    Shutdown,
    Manual,
}

// ─────────────────────────────────────────────────────────
// Symbols and prices
// ─────────────────────────────────────────────────────────

/// Currency pair in "BASE/QUOTE" form, e.g. "EUR/USD".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Symbol {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn quote(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or("")
    }

    /// True if the two pairs have a currency in common on either leg.
    pub fn shares_currency(&self, other: &Symbol) -> bool {
        let (b, q) = (self.base(), self.quote());
        b == other.base() || b == other.quote() || q == other.base() || q == other.quote()
    }

    /// Conventional pip: 1/100 for JPY-quoted pairs, 1/10000 otherwise.
    pub fn pip_size(&self) -> f64 {
        if self.quote() == "JPY" {
            0.01
        } else {
            0.0001
        }
    }

    pub fn pips_to_price(&self, pips: f64) -> f64 {
        pips * self.pip_size()
    }

    pub fn price_to_pips(&self, price_delta: f64) -> f64 {
        price_delta / self.pip_size()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Symbol {
        Symbol(s.to_string())
    }
}

/// Top-of-book quote for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn new(bid: f64, ask: f64) -> Quote {
        Quote { bid, ask }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Side a market order fills at: longs lift the ask, shorts hit the bid.
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Short => self.bid,
            _ => self.ask,
        }
    }

    /// Side an open position exits at.
    pub fn exit_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Short => self.ask,
            _ => self.bid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_monotonic() {
        use TradeStatus::*;
        assert!(Proposed.can_advance(Approved));
        assert!(Proposed.can_advance(Rejected));
        assert!(Approved.can_advance(Executed));
        assert!(Approved.can_advance(Expired));
        assert!(Executed.can_advance(Closed));

        // No going back, no crossing branches.
        assert!(!Approved.can_advance(Proposed));
        assert!(!Rejected.can_advance(Executed));
        assert!(!Rejected.can_advance(Closed));
        assert!(!Expired.can_advance(Closed));
        assert!(!Closed.can_advance(Executed));
        assert!(!Executed.can_advance(Executed));
    }

    #[test]
    fn terminal_states() {
        assert!(TradeStatus::Rejected.is_terminal());
        assert!(TradeStatus::Closed.is_terminal());
        assert!(!TradeStatus::Approved.is_terminal());
        assert!(!TradeStatus::Executed.is_terminal());
    }

    #[test]
    fn pip_size_by_quote_currency() {
        assert_eq!(Symbol::from("EUR/USD").pip_size(), 0.0001);
        assert_eq!(Symbol::from("USD/JPY").pip_size(), 0.01);
        assert!((Symbol::from("EUR/USD").pips_to_price(50.0) - 0.0050).abs() < 1e-12);
    }

    #[test]
    fn shared_currency_detection() {
        let eurusd = Symbol::from("EUR/USD");
        assert!(eurusd.shares_currency(&Symbol::from("USD/CHF")));
        assert!(eurusd.shares_currency(&Symbol::from("EUR/GBP")));
        assert!(!eurusd.shares_currency(&Symbol::from("GBP/JPY")));
    }

    #[test]
    fn quote_entry_exit_sides() {
        let q = Quote::new(1.1000, 1.1002);
        assert_eq!(q.entry_price(Direction::Long), 1.1002);
        assert_eq!(q.entry_price(Direction::Short), 1.1000);
        assert_eq!(q.exit_price(Direction::Long), 1.1000);
        assert_eq!(q.exit_price(Direction::Short), 1.1002);
    }

    #[test]
    fn confidence_roundtrip() {
        assert_eq!(Confidence::from_score(0.9), Confidence::VeryHigh);
        assert_eq!(Confidence::from_score(0.7), Confidence::High);
        assert_eq!(Confidence::from_score(0.5), Confidence::Medium);
        assert_eq!(Confidence::from_score(0.1), Confidence::Low);
        assert!(Confidence::High > Confidence::Medium);
    }
}
