//! Fundamental analysis agent.
//!
//! Owns a small economic calendar. When an event comes due, the agent
//! assesses its impact direction and broadcasts a `fundamental_update`.
//! Trade results feed a per-event accuracy ledger so the assessment
//! confidence degrades for event families that keep being wrong.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{FundamentalUpdate, Message, MessageKind, Payload};
use crate::fabric::types::{Confidence, Direction};

/// One scheduled calendar entry. `release_after_secs` is relative to agent
/// start; absolute calendars belong to the external data layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub event: String,
    pub currencies: Vec<String>,
    pub release_after_secs: u64,
    pub forecast: Option<f64>,
    pub previous: Option<f64>,
    pub high_impact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalConfig {
    pub update_interval_secs: u64,
    pub calendar: Vec<CalendarEvent>,
}

impl Default for FundamentalConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            calendar: vec![
                CalendarEvent {
                    event: "US Non-Farm Payrolls".into(),
                    currencies: vec!["USD".into()],
                    release_after_secs: 120,
                    forecast: Some(180_000.0),
                    previous: Some(175_000.0),
                    high_impact: true,
                },
                CalendarEvent {
                    event: "ECB Rate Decision".into(),
                    currencies: vec!["EUR".into()],
                    release_after_secs: 300,
                    forecast: Some(4.0),
                    previous: Some(4.0),
                    high_impact: true,
                },
                CalendarEvent {
                    event: "UK Retail Sales".into(),
                    currencies: vec!["GBP".into()],
                    release_after_secs: 600,
                    forecast: Some(0.3),
                    previous: Some(0.1),
                    high_impact: false,
                },
            ],
        }
    }
}

#[derive(Debug, Default)]
struct AccuracyLedger {
    assessed: u32,
    confirmed: u32,
}

pub struct FundamentalAgent {
    id: String,
    cfg: FundamentalConfig,
    gate: PeriodicGate,
    started: Instant,
    /// Calendar indices not yet released.
    pending: Vec<usize>,
    accuracy: HashMap<String, AccuracyLedger>,
    /// Recently released events, to match incoming trade results.
    released: Vec<(String, Vec<String>, Direction, Instant)>,
}

impl FundamentalAgent {
    pub fn new(id: impl Into<String>, cfg: FundamentalConfig) -> FundamentalAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.update_interval_secs));
        let pending = (0..cfg.calendar.len()).collect();
        FundamentalAgent {
            id: id.into(),
            cfg,
            gate,
            started: Instant::now(),
            pending,
            accuracy: HashMap::new(),
            released: Vec::new(),
        }
    }

    /// Actual above forecast strengthens the currency, below weakens it.
    /// Ties fall back to the previous print.
    fn assess(event: &CalendarEvent, actual: f64) -> Direction {
        let reference = event.forecast.or(event.previous);
        match reference {
            Some(reference) if actual > reference => Direction::Long,
            Some(reference) if actual < reference => Direction::Short,
            _ => Direction::Neutral,
        }
    }

    fn confidence_for(&self, event: &CalendarEvent) -> Confidence {
        let base = if event.high_impact {
            Confidence::High
        } else {
            Confidence::Medium
        };
        // Degrade when this event family has been mostly wrong.
        match self.accuracy.get(&event.event) {
            Some(ledger) if ledger.assessed >= 4 => {
                let hit_rate = ledger.confirmed as f64 / ledger.assessed as f64;
                if hit_rate < 0.4 {
                    Confidence::Low
                } else {
                    base
                }
            }
            _ => base,
        }
    }

    async fn release_due(&mut self, ctx: &AgentContext) -> bool {
        let elapsed = self.started.elapsed().as_secs();
        let due: Vec<usize> = self
            .pending
            .iter()
            .copied()
            .filter(|i| self.cfg.calendar[*i].release_after_secs <= elapsed)
            .collect();
        if due.is_empty() {
            return false;
        }
        self.pending.retain(|i| !due.contains(i));

        for index in due {
            let event = self.cfg.calendar[index].clone();
            // The simulated print lands within a few percent of forecast.
            let actual = event
                .forecast
                .map(|f| f * (1.0 + rand::thread_rng().gen_range(-0.05..0.05)))
                .unwrap_or(0.0);
            let impact = Self::assess(&event, actual);
            let confidence = self.confidence_for(&event);
            info!(
                event = %event.event,
                impact = impact.as_str(),
                actual,
                "calendar event released"
            );
            self.released
                .push((event.event.clone(), event.currencies.clone(), impact, Instant::now()));
            ctx.send(Payload::FundamentalUpdate(FundamentalUpdate {
                currencies: event.currencies,
                event: event.event,
                actual: Some(actual),
                forecast: event.forecast,
                previous: event.previous,
                impact,
                confidence,
                timestamp: Utc::now(),
            }))
            .await;
        }
        true
    }

    /// Score forecast accuracy: a profitable trade on a currency we recently
    /// assessed counts as a confirmation of that assessment.
    fn score_result(&mut self, profitable: bool, base: &str, quote: &str) {
        let horizon = Duration::from_secs(3600);
        let mut matched = Vec::new();
        self.released.retain(|(event, currencies, _, at)| {
            if at.elapsed() > horizon {
                return false;
            }
            if currencies.iter().any(|c| c == base || c == quote) {
                matched.push(event.clone());
            }
            true
        });
        for event in matched {
            let ledger = self.accuracy.entry(event).or_default();
            ledger.assessed += 1;
            if profitable {
                ledger.confirmed += 1;
            }
        }
    }
}

#[async_trait]
impl Agent for FundamentalAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[MessageKind::TradeResult, MessageKind::SystemStatus]);
        info!(
            agent = %self.id,
            events = self.cfg.calendar.len(),
            "fundamental analysis ready"
        );
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        let released = self.release_due(ctx).await;
        Ok(if released { Activity::Busy } else { Activity::Idle })
    }

    async fn handle_message(
        &mut self,
        _ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        if let Payload::TradeResult(result) = &message.payload {
            let base = result.symbol.base().to_string();
            let quote = result.symbol.quote().to_string();
            self.score_result(result.profit > 0.0, &base, &quote);
            debug!(execution = %result.execution_id, "result folded into accuracy ledger");
        }
        Ok(())
    }
}
