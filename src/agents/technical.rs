//! Technical analysis agent.
//!
//! Consumes `market_data`, keeps a bounded mid-price history per symbol, and
//! periodically runs two light detectors: a short/long average cross and a
//! momentum check against the recent mean. Signals are broadcast only when
//! the detected direction changes, so downstream caches are not flooded with
//! repeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::fabric::agent::{Activity, Agent, AgentContext, PeriodicGate};
use crate::fabric::messages::{Message, MessageKind, Payload, TechnicalSignal};
use crate::fabric::types::{Confidence, Direction, IndicatorKind, Symbol, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalConfig {
    pub update_interval_secs: u64,
    /// Mid prices retained per symbol.
    pub history_limit: usize,
    pub short_window: usize,
    pub long_window: usize,
    /// Cross distance (as a fraction of the long average) below which the
    /// detector stays neutral.
    pub cross_threshold: f64,
    pub timeframe: Timeframe,
}

impl Default for TechnicalConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 30,
            history_limit: 500,
            short_window: 9,
            long_window: 21,
            cross_threshold: 0.0002,
            timeframe: Timeframe::H1,
        }
    }
}

pub struct TechnicalAgent {
    id: String,
    cfg: TechnicalConfig,
    gate: PeriodicGate,
    history: HashMap<Symbol, VecDeque<f64>>,
    /// Last direction emitted per (symbol, detector), to suppress repeats.
    last_emitted: HashMap<(Symbol, IndicatorKind), Direction>,
}

impl TechnicalAgent {
    pub fn new(id: impl Into<String>, cfg: TechnicalConfig) -> TechnicalAgent {
        let gate = PeriodicGate::new(Duration::from_secs(cfg.update_interval_secs));
        TechnicalAgent {
            id: id.into(),
            cfg,
            gate,
            history: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    fn record(&mut self, symbol: Symbol, mid: f64) {
        let series = self.history.entry(symbol).or_default();
        series.push_back(mid);
        while series.len() > self.cfg.history_limit {
            series.pop_front();
        }
    }

    fn mean(series: &VecDeque<f64>, window: usize) -> Option<f64> {
        if series.len() < window || window == 0 {
            return None;
        }
        Some(series.iter().rev().take(window).sum::<f64>() / window as f64)
    }

    /// Short average above long by more than the threshold reads long, below
    /// reads short, in between neutral.
    fn average_cross(&self, series: &VecDeque<f64>) -> Option<(Direction, Confidence, f64)> {
        let short = Self::mean(series, self.cfg.short_window)?;
        let long = Self::mean(series, self.cfg.long_window)?;
        let spread = (short - long) / long;
        let direction = if spread > self.cfg.cross_threshold {
            Direction::Long
        } else if spread < -self.cfg.cross_threshold {
            Direction::Short
        } else {
            Direction::Neutral
        };
        let confidence = Confidence::from_score((spread.abs() / self.cfg.cross_threshold / 4.0).min(1.0));
        Some((direction, confidence, spread))
    }

    /// Last price versus the long-window mean.
    fn momentum(&self, series: &VecDeque<f64>) -> Option<(Direction, Confidence, f64)> {
        let last = *series.back()?;
        let mean = Self::mean(series, self.cfg.long_window)?;
        let drift = (last - mean) / mean;
        let direction = if drift > self.cfg.cross_threshold {
            Direction::Long
        } else if drift < -self.cfg.cross_threshold {
            Direction::Short
        } else {
            Direction::Neutral
        };
        let confidence = Confidence::from_score((drift.abs() / self.cfg.cross_threshold / 5.0).min(1.0));
        Some((direction, confidence, drift))
    }

    async fn analyze(&mut self, ctx: &AgentContext) -> bool {
        let mut emitted = false;
        let symbols: Vec<Symbol> = self.history.keys().cloned().collect();
        for symbol in symbols {
            let Some(series) = self.history.get(&symbol) else { continue };
            let detections = [
                (IndicatorKind::AverageCross, self.average_cross(series)),
                (IndicatorKind::Momentum, self.momentum(series)),
            ];
            for (indicator, detection) in detections {
                let Some((direction, confidence, value)) = detection else { continue };
                let key = (symbol.clone(), indicator);
                if self.last_emitted.get(&key) == Some(&direction) {
                    continue;
                }
                self.last_emitted.insert(key, direction);
                if direction == Direction::Neutral {
                    continue;
                }
                debug!(
                    symbol = %symbol,
                    indicator = ?indicator,
                    direction = direction.as_str(),
                    value,
                    "signal detected"
                );
                ctx.send(Payload::TechnicalSignal(TechnicalSignal {
                    symbol: symbol.clone(),
                    timeframe: self.cfg.timeframe,
                    indicator,
                    direction,
                    confidence,
                    value,
                    timestamp: Utc::now(),
                }))
                .await;
                emitted = true;
            }
        }
        emitted
    }
}

#[async_trait]
impl Agent for TechnicalAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.subscribe_to(&[MessageKind::MarketData, MessageKind::SystemStatus]);
        info!(agent = %self.id, "technical analysis ready");
        Ok(())
    }

    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity> {
        if !self.gate.due() {
            return Ok(Activity::Idle);
        }
        let emitted = self.analyze(ctx).await;
        Ok(if emitted { Activity::Busy } else { Activity::Idle })
    }

    async fn handle_message(
        &mut self,
        _ctx: &AgentContext,
        message: Arc<Message>,
    ) -> anyhow::Result<()> {
        if let Payload::MarketData(quote) = &message.payload {
            self.record(quote.symbol.clone(), quote.quote.mid());
        }
        Ok(())
    }
}
