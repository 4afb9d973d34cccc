//! Asset selection agent.
//!
//! Tracks which symbols are currently tradable: the trading-hours table
//! gates everything, and when a gateway is attached its active-symbol
//! listing narrows the set further. The result is broadcast periodically as
//! a `system_status` availability update; addressed requests get a direct
//! response to the requesting agent only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{Message, MessageKind, Payload, SystemEvent};
use crate::fabric::types::Symbol;
use crate::gateway::TradeGateway;

// ─────────────────────────────────────────────────────────
// Trading hours
// ─────────────────────────────────────────────────────────

/// "HH:MM" bounds for one weekday; `None` on both sides means closed all
/// day. "24:00" is accepted as end-of-day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayHours {
    pub open: Option<String>,
    pub close: Option<String>,
}

impl DayHours {
    fn closed() -> DayHours {
        DayHours {
            open: None,
            close: None,
        }
    }

    fn between(open: &str, close: &str) -> DayHours {
        DayHours {
            open: Some(open.to_string()),
            close: Some(close.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingHours {
    pub monday: DayHours,
    pub tuesday: DayHours,
    pub wednesday: DayHours,
    pub thursday: DayHours,
    pub friday: DayHours,
    pub saturday: DayHours,
    pub sunday: DayHours,
}

impl Default for TradingHours {
    fn default() -> Self {
        // Standard forex week: continuous Monday through Thursday, Friday
        // cuts off at 22:00 UTC, reopens Sunday 22:00 UTC.
        Self {
            monday: DayHours::between("00:00", "24:00"),
            tuesday: DayHours::between("00:00", "24:00"),
            wednesday: DayHours::between("00:00", "24:00"),
            thursday: DayHours::between("00:00", "24:00"),
            friday: DayHours::between("00:00", "22:00"),
            saturday: DayHours::closed(),
            sunday: DayHours::between("22:00", "24:00"),
        }
    }
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (h, m) = value.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 24 || m > 59 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

impl TradingHours {
    fn for_weekday(&self, weekday: Weekday) -> &DayHours {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    /// Whether the market is open at `now`, widened by `tolerance_minutes`
    /// on both ends of the day's window.
    pub fn is_open(&self, now: DateTime<Utc>, tolerance_minutes: u32) -> bool {
        let day = self.for_weekday(now.weekday());
        let (Some(open), Some(close)) = (&day.open, &day.close) else {
            return false;
        };
        let (Some(open), Some(close)) = (parse_hhmm(open), parse_hhmm(close)) else {
            return false;
        };
        if open == 0 && close == 24 * 60 {
            return true;
        }

        let minute = now.hour() * 60 + now.minute();
        let tol = tolerance_minutes;
        if open > close {
            // Window spans midnight.
            minute + tol >= open || minute < close + tol
        } else {
            minute + tol >= open && minute < close + tol
        }
    }
}

// ─────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSelectionConfig {
    pub check_interval_secs: u64,
    pub tolerance_minutes: u32,
    pub primary_symbols: Vec<Symbol>,
    pub fallback_symbols: Vec<Symbol>,
    pub trading_hours: TradingHours,
    pub market: String,
}

impl Default for AssetSelectionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            tolerance_minutes: 30,
            primary_symbols: vec![
                Symbol::from("EUR/USD"),
                Symbol::from("GBP/USD"),
                Symbol::from("USD/JPY"),
                Symbol::from("AUD/USD"),
            ],
            fallback_symbols: vec![
                Symbol::from("USD/CAD"),
                Symbol::from("NZD/USD"),
                Symbol::from("EUR/GBP"),
                Symbol::from("USD/CHF"),
            ],
            trading_hours: TradingHours::default(),
            market: "forex".into(),
        }
    }
}

pub struct AssetSelectionAgent {
    id: String,
    cfg: AssetSelectionConfig,
    gate: PeriodicGate,
    /// Listing source; `None` falls back to the schedule alone.
    gateway: Option<Arc<dyn TradeGateway>>,
    available: Vec<Symbol>,
    recommended: Vec<Symbol>,
    details: Vec<(Symbol, bool)>,
}

impl AssetSelectionAgent {
    pub fn new(
        id: impl Into<String>,
        cfg: AssetSelectionConfig,
        gateway: Option<Arc<dyn TradeGateway>>,
    ) -> AssetSelectionAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.check_interval_secs));
        AssetSelectionAgent {
            id: id.into(),
            cfg,
            gate,
            gateway,
            available: Vec::new(),
            recommended: Vec::new(),
            details: Vec::new(),
        }
    }

    fn all_symbols(&self) -> Vec<Symbol> {
        let mut all = self.cfg.primary_symbols.clone();
        for s in &self.cfg.fallback_symbols {
            if !all.contains(s) {
                all.push(s.clone());
            }
        }
        all
    }

    async fn refresh(&mut self) {
        let all = self.all_symbols();
        if !self
            .cfg
            .trading_hours
            .is_open(Utc::now(), self.cfg.tolerance_minutes)
        {
            debug!("market closed by schedule");
            self.available.clear();
            self.recommended.clear();
            self.details = all.into_iter().map(|s| (s, false)).collect();
            return;
        }

        let listed: Option<Vec<Symbol>> = match &self.gateway {
            Some(gateway) => {
                let listing = gateway.list_active_symbols(&self.cfg.market).await;
                if listing.is_empty() {
                    // Listing failed; trust the schedule rather than go dark.
                    None
                } else {
                    Some(listing.into_iter().map(|info| info.symbol).collect())
                }
            }
            None => None,
        };

        self.available = all
            .iter()
            .filter(|s| listed.as_ref().map(|l| l.contains(s)).unwrap_or(true))
            .cloned()
            .collect();
        self.details = all
            .iter()
            .map(|s| (s.clone(), self.available.contains(s)))
            .collect();

        let primary: Vec<Symbol> = self
            .cfg
            .primary_symbols
            .iter()
            .filter(|s| self.available.contains(s))
            .cloned()
            .collect();
        self.recommended = if primary.is_empty() {
            self.cfg
                .fallback_symbols
                .iter()
                .filter(|s| self.available.contains(s))
                .cloned()
                .collect()
        } else {
            primary
        };

        info!(
            available = self.available.len(),
            recommended = self.recommended.len(),
            "🔍 asset availability refreshed"
        );
    }
}

#[async_trait]
impl Agent for AssetSelectionAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[MessageKind::SystemStatus, MessageKind::MarketData]);
        info!(
            agent = %self.id,
            primary = self.cfg.primary_symbols.len(),
            fallback = self.cfg.fallback_symbols.len(),
            "asset selection ready"
        );
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        self.refresh().await;
        ctx.send(Payload::SystemStatus(SystemEvent::AssetAvailabilityUpdate {
            available: self.available.clone(),
            recommended: self.recommended.clone(),
        }))
        .await;
        Ok(Activity::Busy)
    }

    async fn handle_message(
        &mut self,
        ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        if let Payload::SystemStatus(SystemEvent::AssetAvailabilityRequest) = &message.payload {
            debug!(requester = %message.sender, "answering availability request");
            ctx.send_to(
                Payload::SystemStatus(SystemEvent::AssetAvailabilityResponse {
                    available: self.available.clone(),
                    recommended: self.recommended.clone(),
                    details: self.details.clone(),
                }),
                vec![message.sender.clone()],
            )
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(weekday_date: (i32, u32, u32), hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(weekday_date.0, weekday_date.1, weekday_date.2, hour, minute, 0)
            .unwrap()
    }

    // 2026-07-27 is a Monday.
    const MON: (i32, u32, u32) = (2026, 7, 27);
    const FRI: (i32, u32, u32) = (2026, 7, 31);
    const SAT: (i32, u32, u32) = (2026, 8, 1);
    const SUN: (i32, u32, u32) = (2026, 8, 2);

    #[test]
    fn continuous_days_are_always_open() {
        let hours = TradingHours::default();
        assert!(hours.is_open(at(MON, 0, 0), 0));
        assert!(hours.is_open(at(MON, 23, 59), 0));
    }

    #[test]
    fn friday_closes_early() {
        let hours = TradingHours::default();
        assert!(hours.is_open(at(FRI, 21, 30), 0));
        assert!(!hours.is_open(at(FRI, 22, 30), 0));
        // Tolerance keeps it open a little longer.
        assert!(hours.is_open(at(FRI, 22, 15), 30));
    }

    #[test]
    fn saturday_is_closed_even_with_tolerance() {
        let hours = TradingHours::default();
        assert!(!hours.is_open(at(SAT, 12, 0), 0));
        assert!(!hours.is_open(at(SAT, 12, 0), 120));
    }

    #[test]
    fn sunday_reopens_in_the_evening() {
        let hours = TradingHours::default();
        assert!(!hours.is_open(at(SUN, 12, 0), 0));
        assert!(hours.is_open(at(SUN, 22, 30), 0));
        // Tolerance widens the open edge.
        assert!(hours.is_open(at(SUN, 21, 40), 30));
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let mut hours = TradingHours::default();
        hours.monday = DayHours::between("22:00", "04:00");
        assert!(hours.is_open(at(MON, 23, 0), 0));
        assert!(hours.is_open(at(MON, 2, 0), 0));
        assert!(!hours.is_open(at(MON, 12, 0), 0));
    }

    #[test]
    fn rejects_malformed_times() {
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("07:30"), Some(450));
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("12:75"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[tokio::test]
    async fn schedule_only_refresh_marks_everything_available() {
        let mut agent = AssetSelectionAgent::new(
            "asset_selection",
            AssetSelectionConfig {
                trading_hours: TradingHours {
                    friday: DayHours::between("00:00", "24:00"),
                    saturday: DayHours::between("00:00", "24:00"),
                    sunday: DayHours::between("00:00", "24:00"),
                    ..TradingHours::default()
                },
                ..AssetSelectionConfig::default()
            },
            None,
        );
        agent.refresh().await;
        assert_eq!(agent.available.len(), agent.all_symbols().len());
        // Primaries available, so they are the recommendation.
        assert_eq!(agent.recommended, agent.cfg.primary_symbols);
    }

    #[tokio::test]
    async fn gateway_listing_narrows_and_falls_back() {
        use crate::gateway::{SimulationConfig, SimulationGateway};

        // Gateway only knows USD/CHF: primaries unavailable, fallback wins.
        let gateway = Arc::new(SimulationGateway::new(SimulationConfig {
            drift: false,
            initial_quotes: vec![(Symbol::from("USD/CHF"), 0.88, 0.8802)],
            ..SimulationConfig::default()
        }));
        let mut agent = AssetSelectionAgent::new(
            "asset_selection",
            AssetSelectionConfig {
                trading_hours: TradingHours {
                    friday: DayHours::between("00:00", "24:00"),
                    saturday: DayHours::between("00:00", "24:00"),
                    sunday: DayHours::between("00:00", "24:00"),
                    ..TradingHours::default()
                },
                ..AssetSelectionConfig::default()
            },
            Some(gateway),
        );
        agent.refresh().await;
        assert_eq!(agent.available, vec![Symbol::from("USD/CHF")]);
        assert_eq!(agent.recommended, vec![Symbol::from("USD/CHF")]);
    }
}
