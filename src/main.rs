//! fxswarm entry point.
//!
//! Wiring order matters only at the edges: the broker first, the simulation
//! gateway shared by execution and asset selection, then the six agents.
//! Runs until Ctrl-C; shutdown stops execution first so its close-out
//! results still reach the agents that learn from them.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fxswarm::agents::{
    AssetSelectionAgent, ExecutionAgent, FundamentalAgent, RiskAgent, StrategyAgent,
    TechnicalAgent,
};
use fxswarm::fabric::AgentRunner;
use fxswarm::gateway::{SimulationGateway, TradeGateway};
use fxswarm::{MessageBroker, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Console logging by default; FXSWARM_LOG_DIR switches to a daily file.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match std::env::var("FXSWARM_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "fxswarm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load_or_env(config_path.as_deref())?;

    let broker = Arc::new(MessageBroker::new(settings.broker.to_config()));
    if settings.execution.gateway != "simulation" {
        warn!(
            gateway = %settings.execution.gateway,
            "unsupported gateway type, falling back to simulation"
        );
    }
    let gateway: Arc<SimulationGateway> =
        Arc::new(SimulationGateway::new(settings.simulation.clone()));
    let runtime = settings.runtime.to_config();

    let runners = vec![
        AgentRunner::new(
            Box::new(AssetSelectionAgent::new(
                "asset_selection",
                settings.asset_selection.clone(),
                Some(Arc::clone(&gateway) as Arc<dyn TradeGateway>),
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(TechnicalAgent::new("technical", settings.technical.clone())),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(FundamentalAgent::new(
                "fundamental",
                settings.fundamental.clone(),
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(RiskAgent::new("risk", settings.risk.clone())),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(ExecutionAgent::new(
                "execution",
                settings.execution.clone(),
                Arc::clone(&gateway) as Arc<dyn TradeGateway>,
            )),
            Arc::clone(&broker),
            runtime.clone(),
        ),
        AgentRunner::new(
            Box::new(StrategyAgent::new("strategy", settings.strategy.clone())),
            Arc::clone(&broker),
            runtime.clone(),
        ),
    ];

    for runner in &runners {
        if let Err(err) = runner.start().await {
            error!(agent = runner.id(), %err, "agent failed to start");
        }
    }
    info!(agents = runners.len(), "🚀 system running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown requested");

    // Execution goes down first so its close-out results still reach the
    // running strategy and risk agents; the rest stop together.
    if let Some(exec) = runners.iter().find(|r| r.id() == "execution") {
        exec.stop().await;
    }
    futures::future::join_all(
        runners
            .iter()
            .filter(|r| r.id() != "execution")
            .map(|r| r.stop()),
    )
    .await;
    info!("all agents stopped");
    Ok(())
}
