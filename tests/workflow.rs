//! End-to-end workflow scenarios: real agents over a real broker with the
//! simulation gateway. Scripted senders stand in for the agents a scenario
//! does not exercise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;

use fxswarm::agents::{
    AssetSelectionAgent, AssetSelectionConfig, DayHours, ExecutionAgent, ExecutionConfig,
    FundamentalAgent, FundamentalConfig, RiskAgent, RiskConfig, StrategyAgent, StrategyConfig,
    TechnicalAgent, TechnicalConfig, TradingHours,
};
use fxswarm::fabric::broker::Inbox;
use fxswarm::fabric::messages::{
    Message, MessageKind, Payload, RiskAssessment, SystemEvent, TradeApproval, TradeProposal,
    TradeResult,
};
use fxswarm::fabric::types::{CloseReason, Confidence, Direction, Symbol, TradeStatus};
use fxswarm::fabric::{AgentRunner, AgentRuntimeConfig, BrokerConfig, MessageBroker};
use fxswarm::gateway::simulation::SlippageModel;
use fxswarm::gateway::{SimulationConfig, SimulationGateway, TradeGateway};

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

fn fast_runtime() -> AgentRuntimeConfig {
    AgentRuntimeConfig {
        batch_size: 1,
        batch_interval: Duration::from_millis(10),
    }
}

fn quiet_gateway() -> Arc<SimulationGateway> {
    Arc::new(SimulationGateway::new(SimulationConfig {
        drift: false,
        slippage: SlippageModel::Fixed { pips: 0.0 },
        ..SimulationConfig::default()
    }))
}

fn fast_execution_config() -> ExecutionConfig {
    ExecutionConfig {
        check_interval_secs: 0,
        publish_quotes: false,
        availability_refresh_secs: 3600,
        ..ExecutionConfig::default()
    }
}

fn proposal(id: &str, symbol: &str, size: f64, limit_secs: u64) -> TradeProposal {
    TradeProposal {
        id: id.into(),
        symbol: Symbol::from(symbol),
        direction: Direction::Long,
        size,
        entry_price: None,
        stop_loss_pips: Some(50.0),
        take_profit_pips: Some(100.0),
        time_limit_seconds: limit_secs,
        strategy: "trend_following".into(),
        technical_confidence: Confidence::High,
        fundamental_alignment: Confidence::Medium,
        risk_score: 0.3,
        created_at: Utc::now(),
    }
}

fn assessment(symbol: &str) -> RiskAssessment {
    RiskAssessment {
        symbol: Symbol::from(symbol),
        max_position_size: 10_000.0,
        stop_loss_pips: 50.0,
        take_profit_pips: 100.0,
        max_daily_loss: 500.0,
        exposure: Vec::new(),
        volatility: 0.0,
    }
}

/// Wait for the next message of `kind`, skipping everything else.
async fn recv_kind(inbox: &Inbox, kind: MessageKind, wait: Duration) -> Option<Arc<Message>> {
    timeout(wait, async {
        loop {
            let msg = inbox.recv().await?;
            if msg.kind == kind {
                return Some(msg);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn assert_silent(inbox: &Inbox, kind: MessageKind, wait: Duration) {
    assert!(
        recv_kind(inbox, kind, wait).await.is_none(),
        "expected no further {kind:?} message"
    );
}

// ─────────────────────────────────────────────────────────
// S1: happy path through risk and execution
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_happy_path_reduced_size_take_profit() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let gateway = quiet_gateway();

    // Budget of 0.004 * 10_000 = 40 against a 50-unit stop-out: risk scales
    // the 10k proposal to 8k.
    let risk = AgentRunner::new(
        Box::new(RiskAgent::new(
            "risk",
            RiskConfig {
                max_trade_risk_fraction: 0.004,
                update_interval_secs: 3600,
                ..RiskConfig::default()
            },
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    let exec = AgentRunner::new(
        Box::new(ExecutionAgent::new(
            "execution",
            fast_execution_config(),
            Arc::clone(&gateway) as Arc<dyn TradeGateway>,
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    risk.start().await.unwrap();
    exec.start().await.unwrap();

    // Scripted strategy agent: publishes the proposal, observes the rest.
    let strat = broker.register("strategy").unwrap();
    broker.subscribe(
        "strategy",
        &[
            MessageKind::TradeApproval,
            MessageKind::TradeRejection,
            MessageKind::TradeExecution,
            MessageKind::TradeResult,
        ],
    );

    broker
        .publish(Message::broadcast(
            "strategy",
            Payload::TradeProposal(proposal("p1", "EUR/USD", 10_000.0, 3600)),
        ))
        .await;

    let approval = recv_kind(&strat, MessageKind::TradeApproval, Duration::from_secs(5))
        .await
        .expect("risk should approve");
    let Payload::TradeApproval(approval) = &approval.payload else {
        panic!("wrong payload")
    };
    assert_eq!(approval.proposal.id, "p1");
    assert!((approval.proposal.size - 8_000.0).abs() < 1.0);

    let execution = recv_kind(&strat, MessageKind::TradeExecution, Duration::from_secs(5))
        .await
        .expect("execution event");
    let Payload::TradeExecution(execution) = &execution.payload else {
        panic!("wrong payload")
    };
    assert_eq!(execution.status, TradeStatus::Executed);
    assert!((execution.executed_size - 8_000.0).abs() < 1.0);
    assert!((execution.executed_price - 1.1002).abs() < 1e-9);

    // Take-profit sits 100 pips over the fill; move the market through it.
    gateway.set_price(&Symbol::from("EUR/USD"), 1.1103, 1.1105);

    let result = recv_kind(&strat, MessageKind::TradeResult, Duration::from_secs(5))
        .await
        .expect("trade result");
    let Payload::TradeResult(result) = &result.payload else {
        panic!("wrong payload")
    };
    assert_eq!(result.proposal_id, "p1");
    assert_eq!(result.reason, CloseReason::TakeProfit);
    assert!((result.profit_pips - 101.0).abs() < 1.0);
    assert!(result.profit > 0.0);

    // Exactly one result for this execution.
    assert_silent(&strat, MessageKind::TradeResult, Duration::from_millis(300)).await;

    // The observed trajectory must be a legal path through the state
    // machine: proposed, approved, executed, closed.
    let path = [
        TradeStatus::Proposed,
        TradeStatus::Approved,
        TradeStatus::Executed,
        TradeStatus::Closed,
    ];
    for pair in path.windows(2) {
        assert!(pair[0].can_advance(pair[1]));
    }

    exec.stop().await;
    risk.stop().await;
}

// ─────────────────────────────────────────────────────────
// S2: rejection once the daily loss cap is consumed
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_daily_loss_cap_rejects() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let risk = AgentRunner::new(
        Box::new(RiskAgent::new(
            "risk",
            RiskConfig {
                update_interval_secs: 3600,
                ..RiskConfig::default()
            },
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    risk.start().await.unwrap();

    let strat = broker.register("strategy").unwrap();
    broker.subscribe(
        "strategy",
        &[
            MessageKind::TradeApproval,
            MessageKind::TradeRejection,
            MessageKind::TradeExecution,
        ],
    );

    // Backfill a realised loss beyond the 5% cap of the 10k account.
    broker
        .publish(Message::broadcast(
            "ledger",
            Payload::TradeResult(TradeResult {
                execution_id: "e-prior".into(),
                proposal_id: "p-prior".into(),
                symbol: Symbol::from("GBP/USD"),
                direction: Direction::Long,
                entry_price: 1.2700,
                exit_price: 1.2100,
                size: 10_000.0,
                entered_at: Utc::now(),
                exited_at: Utc::now(),
                profit: -600.0,
                profit_pips: -600.0,
                reason: CloseReason::StopLoss,
                strategy: "trend_following".into(),
            }),
        ))
        .await;
    // Let the loss land before the proposal.
    tokio::time::sleep(Duration::from_millis(200)).await;

    broker
        .publish(Message::broadcast(
            "strategy",
            Payload::TradeProposal(proposal("p2", "EUR/USD", 10_000.0, 3600)),
        ))
        .await;

    let rejection = recv_kind(&strat, MessageKind::TradeRejection, Duration::from_secs(5))
        .await
        .expect("risk should reject");
    let Payload::TradeRejection(rejection) = &rejection.payload else {
        panic!("wrong payload")
    };
    assert_eq!(rejection.proposal_id, "p2");
    assert_eq!(rejection.reason, "daily loss cap");

    // No execution happened for p2: nothing placed an order.
    assert_silent(&strat, MessageKind::TradeExecution, Duration::from_millis(300)).await;

    risk.stop().await;
}

// ─────────────────────────────────────────────────────────
// S3: approval after the deadline is discarded
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s3_late_approval_never_executes() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let gateway = quiet_gateway();
    let exec = AgentRunner::new(
        Box::new(ExecutionAgent::new(
            "execution",
            fast_execution_config(),
            Arc::clone(&gateway) as Arc<dyn TradeGateway>,
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    exec.start().await.unwrap();

    let watcher = broker.register("watcher").unwrap();
    broker.subscribe("watcher", &[MessageKind::TradeExecution, MessageKind::TradeResult]);

    // Risk "thinks" for two seconds past the one-second limit.
    let p3 = proposal("p3", "EUR/USD", 10_000.0, 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    broker
        .publish(Message::broadcast(
            "risk",
            Payload::TradeApproval(TradeApproval {
                proposal: p3,
                assessment: assessment("EUR/USD"),
            }),
        ))
        .await;

    // Nothing fills and nothing closes.
    if let Some(msg) =
        recv_kind(&watcher, MessageKind::TradeExecution, Duration::from_millis(500)).await
    {
        let Payload::TradeExecution(e) = &msg.payload else {
            panic!("wrong payload")
        };
        assert_ne!(e.status, TradeStatus::Executed, "late approval must not fill");
    }
    assert_silent(&watcher, MessageKind::TradeResult, Duration::from_millis(300)).await;
    assert_eq!(gateway.open_order_count(), 0);

    exec.stop().await;
}

// ─────────────────────────────────────────────────────────
// S4: unavailable symbol falls back by shared currency
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s4_fallback_symbol_substitution() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let gateway = quiet_gateway();
    let exec = AgentRunner::new(
        Box::new(ExecutionAgent::new(
            "execution",
            fast_execution_config(),
            Arc::clone(&gateway) as Arc<dyn TradeGateway>,
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    exec.start().await.unwrap();

    let watcher = broker.register("watcher").unwrap();
    broker.subscribe("watcher", &[MessageKind::TradeExecution]);

    // Only USD/CHF is tradable right now.
    broker
        .publish(Message::broadcast(
            "asset_selection",
            Payload::SystemStatus(SystemEvent::AssetAvailabilityUpdate {
                available: vec![Symbol::from("USD/CHF")],
                recommended: vec![Symbol::from("USD/CHF")],
            }),
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    broker
        .publish(Message::broadcast(
            "risk",
            Payload::TradeApproval(TradeApproval {
                proposal: proposal("p4", "EUR/USD", 10_000.0, 3600),
                assessment: assessment("EUR/USD"),
            }),
        ))
        .await;

    let execution = recv_kind(&watcher, MessageKind::TradeExecution, Duration::from_secs(5))
        .await
        .expect("execution event");
    let Payload::TradeExecution(execution) = &execution.payload else {
        panic!("wrong payload")
    };
    assert_eq!(execution.symbol, Symbol::from("USD/CHF"), "USD leg is shared");
    assert_eq!(execution.status, TradeStatus::Executed);

    exec.stop().await;
}

#[tokio::test]
async fn s4b_no_fallback_cancels_without_order() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let gateway = quiet_gateway();
    let exec = AgentRunner::new(
        Box::new(ExecutionAgent::new(
            "execution",
            fast_execution_config(),
            Arc::clone(&gateway) as Arc<dyn TradeGateway>,
        )),
        Arc::clone(&broker),
        fast_runtime(),
    );
    exec.start().await.unwrap();

    let watcher = broker.register("watcher").unwrap();
    broker.subscribe("watcher", &[MessageKind::TradeExecution]);

    broker
        .publish(Message::broadcast(
            "asset_selection",
            Payload::SystemStatus(SystemEvent::AssetAvailabilityUpdate {
                available: vec![Symbol::from("AUD/NZD")],
                recommended: vec![Symbol::from("AUD/NZD")],
            }),
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    broker
        .publish(Message::broadcast(
            "risk",
            Payload::TradeApproval(TradeApproval {
                proposal: proposal("p5", "EUR/USD", 10_000.0, 3600),
                assessment: assessment("EUR/USD"),
            }),
        ))
        .await;

    let execution = recv_kind(&watcher, MessageKind::TradeExecution, Duration::from_secs(5))
        .await
        .expect("cancel event");
    let Payload::TradeExecution(execution) = &execution.payload else {
        panic!("wrong payload")
    };
    assert_eq!(execution.status, TradeStatus::Canceled);
    assert_eq!(gateway.open_order_count(), 0, "no order reached the gateway");

    exec.stop().await;
}

// ─────────────────────────────────────────────────────────
// S5 and S6: broadcast self-exclusion and batch contiguity
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_broadcaster_never_sees_itself() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let a = broker.register("a").unwrap();
    let b = broker.register("b").unwrap();
    broker.subscribe("a", &[MessageKind::SystemStatus]);
    broker.subscribe("b", &[MessageKind::SystemStatus]);

    broker
        .publish(Message::broadcast(
            "a",
            Payload::SystemStatus(SystemEvent::AssetAvailabilityRequest),
        ))
        .await;

    let received = recv_kind(&b, MessageKind::SystemStatus, Duration::from_secs(1))
        .await
        .expect("other subscriber receives the broadcast once");
    assert_eq!(received.sender, "a");
    assert!(a.is_empty(), "sender's inbox stays empty");
    assert!(b.is_empty(), "delivered exactly once");
}

#[tokio::test]
async fn s6_batch_publish_is_contiguous_for_every_subscriber() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let first = broker.register("first").unwrap();
    let second = broker.register("second").unwrap();
    broker.subscribe("first", &[MessageKind::TradeExecution]);
    broker.subscribe("second", &[MessageKind::TradeExecution]);

    let make = |n: u32| {
        Payload::TradeExecution(fxswarm::fabric::messages::TradeExecution {
            proposal_id: format!("p{n}"),
            execution_id: format!("e{n}"),
            symbol: Symbol::from("EUR/USD"),
            direction: Direction::Long,
            executed_size: 1_000.0,
            executed_price: 1.1,
            executed_at: Utc::now(),
            status: TradeStatus::Executed,
            stop_loss: None,
            take_profit: None,
            strategy: "s".into(),
        })
    };
    let batch = vec![
        Message::broadcast("exec", make(1)),
        Message::broadcast("exec", make(2)),
        Message::broadcast("exec", make(3)),
    ];
    broker.publish_batch(batch).await;

    for inbox in [&first, &second] {
        for expected in ["e1", "e2", "e3"] {
            let msg = recv_kind(inbox, MessageKind::TradeExecution, Duration::from_secs(1))
                .await
                .expect("batched message");
            let Payload::TradeExecution(e) = &msg.payload else {
                panic!("wrong payload")
            };
            assert_eq!(e.execution_id, expected);
        }
    }
}

// ─────────────────────────────────────────────────────────
// Full system: all six agents, one trade end to end
// ─────────────────────────────────────────────────────────

fn always_open_hours() -> TradingHours {
    TradingHours {
        friday: DayHours {
            open: Some("00:00".into()),
            close: Some("24:00".into()),
        },
        saturday: DayHours {
            open: Some("00:00".into()),
            close: Some("24:00".into()),
        },
        sunday: DayHours {
            open: Some("00:00".into()),
            close: Some("24:00".into()),
        },
        ..TradingHours::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_system_trades_a_trend_end_to_end() {
    let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
    let gateway = quiet_gateway();
    let runtime = fast_runtime();

    let runners = vec![
        AgentRunner::new(
            Box::new(AssetSelectionAgent::new(
                "asset_selection",
                AssetSelectionConfig {
                    check_interval_secs: 1,
                    trading_hours: always_open_hours(),
                    ..AssetSelectionConfig::default()
                },
                Some(Arc::clone(&gateway) as Arc<dyn TradeGateway>),
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(TechnicalAgent::new(
                "technical",
                TechnicalConfig {
                    update_interval_secs: 0,
                    ..TechnicalConfig::default()
                },
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(FundamentalAgent::new(
                "fundamental",
                FundamentalConfig::default(),
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(RiskAgent::new(
                "risk",
                RiskConfig {
                    update_interval_secs: 3600,
                    ..RiskConfig::default()
                },
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(ExecutionAgent::new(
                "execution",
                ExecutionConfig {
                    check_interval_secs: 0,
                    availability_refresh_secs: 3600,
                    publish_quotes: true,
                    ..ExecutionConfig::default()
                },
                Arc::clone(&gateway) as Arc<dyn TradeGateway>,
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(StrategyAgent::new(
                "strategy",
                StrategyConfig {
                    update_interval_secs: 0,
                    ..StrategyConfig::default()
                },
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
    ];
    for runner in &runners {
        runner.start().await.unwrap();
    }

    let watcher = broker.register("watcher").unwrap();
    broker.subscribe(
        "watcher",
        &[
            MessageKind::TradeProposal,
            MessageKind::TradeExecution,
            MessageKind::TradeResult,
        ],
    );

    // Walk EUR/USD upward so the detectors read a trend.
    let eurusd = Symbol::from("EUR/USD");
    for step in 1..=40u32 {
        let bid = 1.1000 + step as f64 * 0.0004;
        gateway.set_price(&eurusd, bid, bid + 0.0002);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The trend becomes a proposal, then a fill.
    let execution = recv_kind(&watcher, MessageKind::TradeExecution, Duration::from_secs(15))
        .await
        .expect("system should execute a trade off the trend");
    let Payload::TradeExecution(execution) = &execution.payload else {
        panic!("wrong payload")
    };
    assert_eq!(execution.status, TradeStatus::Executed);
    assert_eq!(execution.direction, Direction::Long);

    // Push through the take-profit and wait for this trade's result.
    let take = execution.take_profit.expect("take profit set");
    gateway.set_price(&execution.symbol, take + 0.0010, take + 0.0012);

    let wanted = execution.execution_id.clone();
    let result = timeout(Duration::from_secs(15), async {
        loop {
            let Some(msg) = watcher.recv().await else {
                panic!("watcher inbox closed")
            };
            if let Payload::TradeResult(result) = &msg.payload {
                if result.execution_id == wanted {
                    break result.clone();
                }
            }
        }
    })
    .await
    .expect("result for the executed trade");
    assert_eq!(result.reason, CloseReason::TakeProfit);
    assert!(result.profit > 0.0);

    // Shutdown mirrors the binary: execution first, then the rest.
    for id in ["execution", "strategy", "risk", "technical", "fundamental", "asset_selection"] {
        if let Some(runner) = runners.iter().find(|r| r.id() == id) {
            runner.stop().await;
        }
    }
}
