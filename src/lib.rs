//! fxswarm: a cooperative multi-agent forex trading system.
//!
//! Six long-running agents exchange typed messages through a process-wide
//! broker. Technical and fundamental analysis feed a strategy agent whose
//! proposals cross risk review before the execution agent trades them
//! through a gateway; results flow back so strategy and risk can learn.

pub mod agents;
pub mod config;
pub mod fabric;
pub mod gateway;

pub use config::Settings;
pub use fabric::{Agent, AgentRunner, AgentRuntimeConfig, BrokerConfig, MessageBroker};
