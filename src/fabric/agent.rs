//! Uniform agent lifecycle and cooperative loop.
//!
//! Every agent implements the `Agent` trait and runs inside an `AgentRunner`
//! task: drain a bounded slice of the inbox, flush the outbound batch when it
//! ages out, run one `process_cycle`, yield briefly when idle. Errors from
//! the hooks are logged and swallowed; only task cancellation stops the loop
//! from the outside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Inbox, MessageBroker};
use super::messages::{Message, MessageKind, Payload};
use super::types::AgentId;

/// Sleep after a failed `process_cycle`, so a persistent error cannot spin.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Yield when an iteration did no work at all.
const IDLE_YIELD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Running,
    Stopping,
    Stopped,
}

/// What a `process_cycle` pass reports back to the loop. `Idle` combined
/// with an empty inbox triggers the short yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Busy,
    Idle,
}

#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    /// Inbox messages drained per iteration, and the outbound flush size.
    pub batch_size: usize,
    /// Maximum age of a non-empty outbound batch before it is flushed.
    pub batch_interval: Duration,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval: Duration::from_millis(500),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Agent trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Agent: Send + 'static {
    fn id(&self) -> &str;

    /// One-time initialisation after registration, before the loop starts.
    async fn setup(&mut self, ctx: &AgentContext) -> anyhow::Result<()>;

    /// One pass of domain work. Runs every loop iteration; periodic agents
    /// gate their own cadence with `PeriodicGate`.
    async fn process_cycle(&mut self, ctx: &AgentContext) -> anyhow::Result<Activity>;

    /// React to one inbox message. An error here consumes the message.
    async fn handle_message(&mut self, ctx: &AgentContext, message: Arc<Message>)
        -> anyhow::Result<()>;

    /// Final teardown, after the last flush and before unregistration.
    async fn cleanup(&mut self, _ctx: &AgentContext) {}
}

// ─────────────────────────────────────────────────────────
// Context: the plumbing handed to every hook
// ─────────────────────────────────────────────────────────

struct OutboundBatch {
    queue: Vec<Message>,
    last_flush: Instant,
}

/// Non-owning handle to the broker plus the agent's outbound batch. Cloned
/// into the one-shot flush timer; the broker outlives every context.
#[derive(Clone)]
pub struct AgentContext {
    id: AgentId,
    broker: Arc<MessageBroker>,
    cfg: AgentRuntimeConfig,
    outbound: Arc<Mutex<OutboundBatch>>,
    flush_armed: Arc<AtomicBool>,
}

impl AgentContext {
    pub fn new(
        id: impl Into<AgentId>,
        broker: Arc<MessageBroker>,
        cfg: AgentRuntimeConfig,
    ) -> AgentContext {
        AgentContext {
            id: id.into(),
            broker,
            cfg,
            outbound: Arc::new(Mutex::new(OutboundBatch {
                queue: Vec::new(),
                last_flush: Instant::now(),
            })),
            flush_armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.id
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// Queue a broadcast for batched publish.
    pub async fn send(&self, payload: Payload) {
        self.enqueue(Message::broadcast(self.id.clone(), payload)).await;
    }

    /// Queue a direct message for batched publish.
    pub async fn send_to(&self, payload: Payload, recipients: Vec<AgentId>) {
        self.enqueue(Message::new(self.id.clone(), payload, recipients))
            .await;
    }

    pub fn subscribe_to(&self, kinds: &[MessageKind]) {
        self.broker.subscribe(&self.id, kinds);
    }

    pub fn unsubscribe_from(&self, kinds: &[MessageKind]) {
        self.broker.unsubscribe(&self.id, kinds);
    }

    async fn enqueue(&self, message: Message) {
        let over_threshold = {
            let mut batch = self.outbound.lock();
            batch.queue.push(message);
            batch.queue.len() >= self.cfg.batch_size
        };
        if over_threshold {
            self.flush_outbound().await;
        } else if !self.flush_armed.swap(true, Ordering::AcqRel) {
            // First message of a fresh batch arms exactly one timer, so a
            // trickle of sends still flushes after batch_interval. A timer
            // that loses the race to the size path finds an empty buffer.
            let ctx = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ctx.cfg.batch_interval).await;
                ctx.flush_outbound().await;
            });
        }
    }

    /// Publish everything currently buffered as one batch.
    pub async fn flush_outbound(&self) {
        let pending = {
            let mut batch = self.outbound.lock();
            batch.last_flush = Instant::now();
            std::mem::take(&mut batch.queue)
        };
        self.flush_armed.store(false, Ordering::Release);
        if pending.is_empty() {
            return;
        }
        debug!(agent = %self.id, count = pending.len(), "flushing outbound batch");
        self.broker.publish_batch(pending).await;
    }

    fn outbound_aged(&self) -> bool {
        let batch = self.outbound.lock();
        !batch.queue.is_empty() && batch.last_flush.elapsed() >= self.cfg.batch_interval
    }

    #[cfg(test)]
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().queue.len()
    }
}

// ─────────────────────────────────────────────────────────
// Periodic gate
// ─────────────────────────────────────────────────────────

/// At most one periodic pass per interval, eventually triggered. The first
/// call is always due so agents do their initial pass right after setup.
#[derive(Debug)]
pub struct PeriodicGate {
    last: Option<Instant>,
    interval: Duration,
}

impl PeriodicGate {
    pub fn new(interval: Duration) -> PeriodicGate {
        PeriodicGate {
            last: None,
            interval,
        }
    }

    pub fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ─────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────

/// Owns one agent's task and lifecycle. `start` is legal only from `New`,
/// `stop` only from `Running`; both degrade to warnings on repeats.
pub struct AgentRunner {
    id: AgentId,
    ctx: AgentContext,
    state: Arc<Mutex<LifecycleState>>,
    stop_tx: watch::Sender<bool>,
    agent: Mutex<Option<Box<dyn Agent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRunner {
    pub fn new(
        agent: Box<dyn Agent>,
        broker: Arc<MessageBroker>,
        cfg: AgentRuntimeConfig,
    ) -> Arc<AgentRunner> {
        let id = agent.id().to_string();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(AgentRunner {
            ctx: AgentContext::new(id.clone(), broker, cfg),
            id,
            state: Arc::new(Mutex::new(LifecycleState::New)),
            stop_tx,
            agent: Mutex::new(Some(agent)),
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Register with the broker, run `setup`, then enter the cooperative
    /// loop on a fresh task.
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::New {
                warn!(agent = %self.id, state = ?*state, "start ignored");
                return Ok(());
            }
            *state = LifecycleState::Running;
        }

        let inbox = match self.ctx.broker.register(&self.id) {
            Ok(inbox) => inbox,
            Err(err) => {
                *self.state.lock() = LifecycleState::New;
                return Err(err.into());
            }
        };

        let mut agent = self
            .agent
            .lock()
            .take()
            .expect("agent present in New state");
        if let Err(err) = agent.setup(&self.ctx).await {
            error!(agent = %self.id, %err, "setup failed");
            self.ctx.broker.unregister(&self.id);
            *self.state.lock() = LifecycleState::Stopped;
            return Err(err);
        }

        info!(agent = %self.id, "started");
        let ctx = self.ctx.clone();
        let state = Arc::clone(&self.state);
        let stop_rx = self.stop_tx.subscribe();
        let task = tokio::spawn(run_loop(agent, ctx, inbox, stop_rx, state));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Signal the loop, wait for it to finish its pass, flush, clean up,
    /// unregister. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Running => *state = LifecycleState::Stopping,
                _ => {
                    debug!(agent = %self.id, state = ?*state, "stop ignored");
                    return;
                }
            }
        }
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(agent = %self.id, "agent task panicked during stop");
                }
            }
        }
        // Covers a cancelled or panicked loop that never reached its own
        // unregister; a second unregister is a no-op.
        self.ctx.broker.unregister(&self.id);
        *self.state.lock() = LifecycleState::Stopped;
        info!(agent = %self.id, "stopped");
    }
}

/// The cooperative loop. Runs on its own task until the stop flag trips,
/// then flushes, cleans up and unregisters.
async fn run_loop(
    mut agent: Box<dyn Agent>,
    ctx: AgentContext,
    inbox: Inbox,
    stop_rx: watch::Receiver<bool>,
    state: Arc<Mutex<LifecycleState>>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        // 1. Drain a bounded slice of the inbox.
        let mut processed = 0usize;
        while processed < ctx.cfg.batch_size {
            let Some(message) = inbox.try_recv() else { break };
            processed += 1;
            if let Err(err) = agent.handle_message(&ctx, Arc::clone(&message)).await {
                error!(
                    agent = %ctx.id,
                    msg_id = %message.id,
                    kind = message.kind.as_str(),
                    %err,
                    "handle_message failed, message dropped"
                );
            }
        }

        // 2. Flush an aged outbound batch on otherwise-quiet iterations.
        if processed == 0 && ctx.outbound_aged() {
            ctx.flush_outbound().await;
        }

        // 3. One domain pass.
        let activity = match agent.process_cycle(&ctx).await {
            Ok(activity) => activity,
            Err(err) => {
                error!(agent = %ctx.id, %err, "process_cycle failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        // 4. Nothing happened: give the scheduler room.
        if processed == 0 && activity == Activity::Idle {
            tokio::time::sleep(IDLE_YIELD).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    ctx.flush_outbound().await;
    agent.cleanup(&ctx).await;
    // Cleanup may have queued shutdown messages of its own.
    ctx.flush_outbound().await;
    ctx.broker.unregister(&ctx.id);
    *state.lock() = LifecycleState::Stopped;
}
