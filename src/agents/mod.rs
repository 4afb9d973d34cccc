//! Concrete agents. Each consumes a subset of message kinds and produces
//! another subset; together they form the signal → proposal → risk →
//! execution → result workflow.

pub mod asset_selection;
pub mod execution;
pub mod fundamental;
pub mod risk;
pub mod strategy;
pub mod technical;

pub use asset_selection::{AssetSelectionAgent, AssetSelectionConfig, DayHours, TradingHours};
pub use execution::{ExecutionAgent, ExecutionConfig};
pub use fundamental::{FundamentalAgent, FundamentalConfig};
pub use risk::{RiskAgent, RiskConfig};
pub use strategy::{StrategyAgent, StrategyConfig};
pub use technical::{TechnicalAgent, TechnicalConfig};
