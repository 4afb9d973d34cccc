//! Agent runtime and message fabric: typed envelopes, the pub/sub broker,
//! and the uniform lifecycle every agent runs on.

pub mod agent;
pub mod broker;
pub mod messages;
pub mod types;

pub use agent::{Activity, Agent, AgentContext, AgentRunner, AgentRuntimeConfig, PeriodicGate};
pub use broker::{BrokerConfig, BrokerError, Inbox, MessageBroker};
pub use messages::{Message, MessageId, MessageKind, Payload};
