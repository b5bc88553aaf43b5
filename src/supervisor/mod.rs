//! Supervisor - agent registry, lifecycle transitions and config reload
//!
//! The supervisor owns every agent actor of the process. It resolves
//! descriptors to agent ids, routes inbox items, applies the
//! `active → sleeping → dead` lifecycle, and bridges the signal bus to
//! agent inboxes.
//!
//! ```text
//!                 ┌──────────────┐  generate   ┌───────────┐
//!   post ───────▶ │  Supervisor  │◀────────────│  Signals  │◀── DelayedSignals
//!                 │              │  deliver    └───────────┘        ▲
//!                 │  registry    │                                   │ idle /
//!                 │  wake/sleep  │───────── schedule ────────────────┘ poison-pill
//!                 └──────┬───────┘
//!                        ▼
//!                 AgentHandle ─▶ Inbox ─▶ Agent actor
//! ```
//!
//! Config reloads take the write side of a read/write gate. Agent handlers
//! and delayed deliveries hold the read side, so a reload waits for
//! in-flight work and new work waits for the reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{
    Agent, AgentDescriptor, AgentHandle, AgentRecord, AgentRuntime, AgentState, AgentSummary,
    CharsPerTokenEstimator, CompletionHandle, EvictionAction, Inbox, InboxItem, InboxResult, Lifecycle,
    TokenEstimator,
};
use crate::channels::ConnectorRegistry;
use crate::config::Config;
use crate::error::{Result, VisorError};
use crate::events::EventBus;
use crate::log_component;
use crate::providers::{InferenceRouter, NoopInferenceRouter};
use crate::session::HistoryRecord;
use crate::signals::{
    DelayedSignalInput, DelayedSignals, Signal, SignalDelivery, SignalGenerateInput, SignalSource,
    SignalSubscription, Signals,
};
use crate::storage::{FileStorage, Storage};
use crate::tools::{register_signal_tools, Tool, ToolRegistry};
use crate::utils::clock::{Clock, SystemClock};

/// Repeat key of the eviction entry of a sleeping subagent or app.
pub const POISON_PILL_KEY: &str = "lifecycle-poison-pill";
/// Repeat key of the idle lifecycle signal.
pub const IDLE_KEY: &str = "lifecycle-idle";
/// Injected into an agent that is evicted while busy.
pub const TERMINATION_MESSAGE: &str =
    "You have been terminated due to inactivity. Stop all work immediately.";

/// `agent:<id>:<event>` lifecycle signal type.
pub fn lifecycle_signal_type(agent_id: &str, event: &str) -> String {
    format!("agent:{}:{}", agent_id, event)
}

/// Agent id of an `agent:<id>:poison-pill` signal type.
fn poison_pill_target(signal_type: &str) -> Option<&str> {
    let mut parts = signal_type.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("agent"), Some(id), Some("poison-pill"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Where an item should go.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTarget {
    Id(String),
    /// Resolved (and created on first use) through the descriptor index
    Descriptor(AgentDescriptor),
}

impl From<AgentDescriptor> for AgentTarget {
    fn from(descriptor: AgentDescriptor) -> Self {
        AgentTarget::Descriptor(descriptor)
    }
}

impl From<&str> for AgentTarget {
    fn from(id: &str) -> Self {
        AgentTarget::Id(id.to_string())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Supervisor`] from its collaborators.
///
/// # Example
/// ```
/// use agentvisor::config::Config;
/// use agentvisor::storage::MemoryStorage;
/// use agentvisor::supervisor::SupervisorBuilder;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let supervisor = SupervisorBuilder::new(Config::default())
///     .storage(Arc::new(MemoryStorage::new()))
///     .build()
///     .await
///     .unwrap();
/// supervisor.start().await.unwrap();
/// assert!(supervisor.list_agents().await.is_empty());
/// supervisor.stop().await;
/// # })
/// ```
pub struct SupervisorBuilder {
    config: Config,
    storage: Option<Arc<dyn Storage>>,
    router: Option<Arc<dyn InferenceRouter>>,
    tools: ToolRegistry,
    connectors: ConnectorRegistry,
    clock: Option<Arc<dyn Clock>>,
    events: EventBus,
    estimator: Option<Arc<dyn TokenEstimator>>,
}

impl SupervisorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            router: None,
            tools: ToolRegistry::new(),
            connectors: ConnectorRegistry::new(),
            clock: None,
            events: EventBus::new(),
            estimator: None,
        }
    }

    /// Defaults to [`FileStorage`] under the configured data directory.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn inference(mut self, router: Arc<dyn InferenceRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Add a tool next to the built-in signal tools.
    pub fn tool(mut self, tool: Box<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub async fn build(self) -> Result<Arc<Supervisor>> {
        self.config.validate()?;
        let data_dir = self.config.data_dir();
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FileStorage::new(data_dir.clone())?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let router: Arc<dyn InferenceRouter> =
            self.router.unwrap_or_else(|| Arc::new(NoopInferenceRouter));
        let estimator: Arc<dyn TokenEstimator> = self
            .estimator
            .unwrap_or_else(|| Arc::new(CharsPerTokenEstimator));

        let gate = Arc::new(RwLock::new(self.config.clone()));
        let signals = Arc::new(Signals::new(
            storage.clone(),
            self.events.clone(),
            clock.clone(),
            self.config.signals.clone(),
        ));
        let delayed = Arc::new(DelayedSignals::new(
            storage.clone(),
            signals.clone(),
            self.events.clone(),
            clock.clone(),
            gate.clone(),
        ));

        let mut tools = self.tools;
        register_signal_tools(&mut tools, &signals);

        let runtime = Arc::new(AgentRuntime {
            storage,
            router,
            tools: Arc::new(tools),
            connectors: self.connectors,
            signals: signals.clone(),
            events: self.events,
            clock,
            estimator,
            gate,
        });

        let supervisor = Arc::new_cyclic(|weak| Supervisor {
            runtime,
            delayed,
            data_dir,
            agents: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            resolve_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        signals
            .set_delivery(Arc::new(SupervisorDelivery(Arc::downgrade(&supervisor))))
            .await;
        Ok(supervisor)
    }
}

/// Bridges signal delivery back into the supervisor without a strong cycle.
struct SupervisorDelivery(Weak<Supervisor>);

#[async_trait]
impl SignalDelivery for SupervisorDelivery {
    async fn deliver(&self, signal: &Signal, subscriptions: &[SignalSubscription]) -> Result<()> {
        match self.0.upgrade() {
            Some(supervisor) => supervisor.deliver(signal, subscriptions).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    runtime: Arc<AgentRuntime>,
    delayed: Arc<DelayedSignals>,
    data_dir: PathBuf,
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes agent creation and lazy restores
    resolve_lock: Mutex<()>,
    started: AtomicBool,
    weak_self: Weak<Supervisor>,
}

impl Supervisor {
    pub fn signals(&self) -> &Arc<Signals> {
        &self.runtime.signals
    }

    pub fn delayed(&self) -> &Arc<DelayedSignals> {
        &self.delayed
    }

    pub fn events(&self) -> &EventBus {
        &self.runtime.events
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.runtime.storage
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.runtime.connectors
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> Config {
        self.runtime.gate.read().await.clone()
    }

    fn now(&self) -> i64 {
        self.runtime.clock.now_ms()
    }

    // ------------------------------------------------------------------
    // Startup and shutdown
    // ------------------------------------------------------------------

    /// Load signals and delayed entries, restore every non-dead agent, then
    /// start the delayed signal timer.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.runtime.signals.load().await?;
        let delayed = self.delayed.load().await?;
        let restored = self.restore_agents().await?;
        self.delayed.start().await?;

        self.runtime
            .events
            .emit("supervisor.started", json!({ "agents": restored, "delayed": delayed }));
        log_component!(
            info,
            "supervisor",
            "Supervisor started",
            agents = restored,
            delayed = delayed
        );
        Ok(())
    }

    async fn restore_agents(&self) -> Result<usize> {
        let records = self.runtime.storage.agent_records_list().await?;
        let poison_delay = self.runtime.gate.read().await.agents.poison_pill_delay_ms;
        let now = self.now();
        let mut restored = 0;

        for record in records {
            let state = match self.runtime.storage.agent_state_read(&record.id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    warn!(agent_id = %record.id, "Agent record without state; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(agent_id = %record.id, "Failed to read agent state: {}", e);
                    continue;
                }
            };

            match state.lifecycle {
                Lifecycle::Dead => continue,
                Lifecycle::Sleeping if record.descriptor.is_evictable() => {
                    let deadline = state.slept_at.unwrap_or(state.updated_at) + poison_delay;
                    if deadline <= now {
                        self.kill_persisted(&record, state).await;
                        continue;
                    }
                    self.schedule_poison_pill(&record, deadline).await;
                }
                _ => {}
            }

            self.spawn_restored(record, state).await;
            restored += 1;
        }
        Ok(restored)
    }

    /// Close every inbox, abort in-flight calls and wait for the loops.
    pub async fn stop(&self) {
        self.delayed.stop().await;
        let handles: Vec<Arc<AgentHandle>> = self.agents.read().await.values().cloned().collect();
        for handle in &handles {
            handle.mark_closing();
            handle.abort();
            handle.inbox.close();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        futures::future::join_all(tasks).await;
        self.started.store(false, Ordering::SeqCst);
        self.runtime.events.emit("supervisor.stopped", json!({}));
        info!("Supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Agent id for `descriptor`, creating the agent on first use.
    pub async fn resolve(&self, descriptor: &AgentDescriptor) -> Result<String> {
        let _resolve = self.resolve_lock.lock().await;
        let storage = &self.runtime.storage;

        let agent_id = match descriptor.lookup_key() {
            Some(key) => match storage.index_get(&format!("agent:{}", key)).await? {
                Some(id) => id,
                None => Uuid::new_v4().to_string(),
            },
            None => descriptor.stable_id().ok_or_else(|| {
                VisorError::InvalidInput(format!("{} descriptor has no id", descriptor.kind()))
            })?,
        };

        if self.agents.read().await.contains_key(&agent_id)
            || storage.agent_record_read(&agent_id).await?.is_some()
        {
            return Ok(agent_id);
        }

        let user_id = self.owner_for(descriptor).await?;
        let now = self.now();
        let record = AgentRecord {
            id: agent_id.clone(),
            user_id,
            descriptor: descriptor.clone(),
            created_at: now,
        };
        storage.agent_record_write(&record).await?;
        if let Some(key) = descriptor.lookup_key() {
            storage.index_put(&format!("agent:{}", key), &agent_id).await?;
        }
        let agent_dir = self.data_dir.join("agents").join(&agent_id);
        let state = AgentState::new(
            descriptor.default_permissions(&agent_dir),
            Uuid::new_v4().to_string(),
            now,
        );
        storage.agent_state_write(&agent_id, &state).await?;
        storage
            .history_append(&agent_id, &HistoryRecord::Start { at: now })
            .await?;

        let user_id = record.user_id.clone();
        self.spawn_agent(record, state).await;
        self.runtime.events.emit(
            "agent.created",
            json!({ "agentId": agent_id, "kind": descriptor.kind(), "userId": user_id }),
        );
        info!(agent_id = %agent_id, kind = descriptor.kind(), "Agent created");
        Ok(agent_id)
    }

    /// Owning account of a new agent. Spawned workers inherit their parent's.
    async fn owner_for(&self, descriptor: &AgentDescriptor) -> Result<String> {
        match descriptor {
            AgentDescriptor::User {
                connector, user_id, ..
            } => self.owner_id(&format!("owner:{}:{}", connector, user_id)).await,
            AgentDescriptor::Subuser { id, .. } => self.owner_id(&format!("owner:subuser:{}", id)).await,
            AgentDescriptor::Subagent {
                parent_agent_id, ..
            }
            | AgentDescriptor::App {
                parent_agent_id, ..
            } => {
                let parent = self
                    .runtime
                    .storage
                    .agent_record_read(parent_agent_id)
                    .await?
                    .ok_or_else(|| VisorError::AgentNotFound(parent_agent_id.clone()))?;
                Ok(parent.user_id)
            }
            _ => self.owner_id("owner:default").await,
        }
    }

    async fn owner_id(&self, key: &str) -> Result<String> {
        if let Some(id) = self.runtime.storage.index_get(key).await? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.runtime.storage.index_put(key, &id).await?;
        Ok(id)
    }

    async fn spawn_agent(&self, record: AgentRecord, state: AgentState) -> Arc<AgentHandle> {
        let handle = Arc::new(AgentHandle::new(record, state.lifecycle));
        let agent = Agent::new(
            handle.clone(),
            state,
            self.runtime.clone(),
            self.weak_self.clone(),
        );
        self.agents
            .write()
            .await
            .insert(handle.id.clone(), handle.clone());
        let task = tokio::spawn(agent.run());
        self.tasks.lock().await.push(task);
        handle
    }

    /// Spawn an existing agent and queue a restore ahead of everything else.
    async fn spawn_restored(&self, record: AgentRecord, state: AgentState) -> Arc<AgentHandle> {
        let handle = self.spawn_agent(record, state).await;
        // Nobody waits for the restore result.
        drop(handle.inbox.post_front(InboxItem::Restore));
        handle
    }

    /// Resident handle of `target`, restoring a persisted agent if needed.
    async fn target_handle(&self, target: AgentTarget) -> Result<Arc<AgentHandle>> {
        let agent_id = match target {
            AgentTarget::Id(id) => id,
            AgentTarget::Descriptor(descriptor) => self.resolve(&descriptor).await?,
        };
        if let Some(handle) = self.handle(&agent_id).await {
            return Ok(handle);
        }

        let _resolve = self.resolve_lock.lock().await;
        if let Some(handle) = self.handle(&agent_id).await {
            return Ok(handle);
        }
        let storage = &self.runtime.storage;
        let record = storage
            .agent_record_read(&agent_id)
            .await?
            .ok_or_else(|| VisorError::AgentNotFound(agent_id.clone()))?;
        let state = storage
            .agent_state_read(&agent_id)
            .await?
            .ok_or_else(|| VisorError::AgentNotFound(agent_id.clone()))?;
        if state.lifecycle == Lifecycle::Dead {
            return Err(VisorError::AgentDead(agent_id));
        }
        debug!(agent_id = %agent_id, "Restoring agent on demand");
        Ok(self.spawn_restored(record, state).await)
    }

    pub async fn handle(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Enqueue `item`, waking the agent if it sleeps.
    pub async fn post(&self, target: AgentTarget, item: InboxItem) -> Result<CompletionHandle> {
        self.enqueue(target, |inbox| inbox.post(item)).await
    }

    /// Enqueue `item` without waiting on it. Pending detached messages may
    /// merge with it.
    pub async fn send(&self, target: AgentTarget, item: InboxItem) -> Result<()> {
        self.enqueue(target, |inbox| inbox.send(item)).await
    }

    async fn enqueue<T>(&self, target: AgentTarget, push: impl FnOnce(&Inbox) -> T) -> Result<T> {
        let handle = self.target_handle(target).await?;
        let (pushed, woke) = {
            let _transition = handle.transition.lock().await;
            handle.accepts_posts()?;
            let woke = handle.lifecycle() == Lifecycle::Sleeping;
            if woke {
                handle.set_lifecycle(Lifecycle::Active);
                self.cancel_lifecycle_timers(&handle.id).await;
            }
            (push(&*handle.inbox), woke)
        };
        if woke {
            self.announce(&handle, "wake", "agent.woke").await;
        }
        Ok(pushed)
    }

    /// Enqueue `item` and wait for its result.
    pub async fn post_and_await(&self, target: AgentTarget, item: InboxItem) -> Result<InboxResult> {
        let label = match &target {
            AgentTarget::Id(id) => id.clone(),
            AgentTarget::Descriptor(descriptor) => descriptor.label(),
        };
        let completion = self.post(target, item).await?;
        completion
            .await
            .map_err(|_| VisorError::InboxClosed(label))?
    }

    /// Steering text for the agent's next inference round.
    pub async fn steer(&self, agent_id: &str, text: &str) -> Result<()> {
        let handle = self
            .handle(agent_id)
            .await
            .ok_or_else(|| VisorError::AgentNotFound(agent_id.to_string()))?;
        handle.accepts_posts()?;
        handle.inbox.steer(text);
        Ok(())
    }

    /// Cancel the inference or compaction call in flight.
    pub async fn abort(&self, agent_id: &str) -> Result<bool> {
        let handle = self
            .handle(agent_id)
            .await
            .ok_or_else(|| VisorError::AgentNotFound(agent_id.to_string()))?;
        Ok(handle.abort())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Put the agent to sleep if nothing is queued. Called by the agent loop
    /// after each item.
    pub(crate) async fn sleep_if_idle(&self, handle: &Arc<AgentHandle>, state: &mut AgentState) {
        let agents = self.runtime.gate.read().await.agents.clone();
        {
            let _transition = handle.transition.lock().await;
            if !handle.inbox.is_empty()
                || handle.lifecycle() != Lifecycle::Active
                || handle.is_terminating()
                || handle.is_closing()
            {
                return;
            }
            let now = self.now();
            handle.set_lifecycle(Lifecycle::Sleeping);
            state.lifecycle = Lifecycle::Sleeping;
            state.slept_at = Some(now);
            if let Err(e) = self.runtime.storage.agent_state_write(&handle.id, state).await {
                warn!(agent_id = %handle.id, "Failed to persist sleeping state: {}", e);
            }

            let idle = DelayedSignalInput::new(
                &lifecycle_signal_type(&handle.id, "idle"),
                now + agents.idle_signal_delay_ms,
                SignalSource::system(),
            )
            .with_repeat_key(IDLE_KEY)
            .with_data(json!({ "agentId": handle.id }));
            if let Err(e) = self.delayed.schedule(idle).await {
                warn!(agent_id = %handle.id, "Failed to schedule idle signal: {}", e);
            }
            if handle.record.descriptor.is_evictable() {
                self.schedule_poison_pill(&handle.record, now + agents.poison_pill_delay_ms)
                    .await;
            }
        }
        self.announce(handle, "sleep", "agent.sleep").await;
    }

    async fn schedule_poison_pill(&self, record: &AgentRecord, deliver_at: i64) {
        let input = DelayedSignalInput::new(
            &lifecycle_signal_type(&record.id, "poison-pill"),
            deliver_at,
            SignalSource::agent(&record.id, Some(record.user_id.as_str())),
        )
        .with_repeat_key(POISON_PILL_KEY)
        .with_data(json!({ "agentId": record.id, "state": "sleeping" }));
        if let Err(e) = self.delayed.schedule(input).await {
            warn!(agent_id = %record.id, "Failed to schedule poison pill: {}", e);
        }
    }

    async fn cancel_lifecycle_timers(&self, agent_id: &str) {
        for (event, key) in [("poison-pill", POISON_PILL_KEY), ("idle", IDLE_KEY)] {
            if let Err(e) = self
                .delayed
                .cancel_by_repeat_key(&lifecycle_signal_type(agent_id, event), key)
                .await
            {
                warn!(agent_id = %agent_id, "Failed to cancel {} entry: {}", event, e);
            }
        }
    }

    /// Emit the engine event and the `agent:<id>:<event>` signal.
    async fn announce(&self, handle: &AgentHandle, event: &str, engine_event: &str) {
        self.runtime
            .events
            .emit(engine_event, json!({ "agentId": handle.id }));
        debug!(agent_id = %handle.id, event, "Agent lifecycle transition");
        let input = SignalGenerateInput::new(
            &lifecycle_signal_type(&handle.id, event),
            SignalSource::agent(&handle.id, Some(handle.record.user_id.as_str())),
        );
        if let Err(e) = self.runtime.signals.generate(input).await {
            warn!(agent_id = %handle.id, "Failed to generate {} signal: {}", event, e);
        }
    }

    /// Route a generated signal to its subscribers; poison pills are handled
    /// here whether or not anyone subscribed.
    async fn deliver(&self, signal: &Signal, subscriptions: &[SignalSubscription]) -> Result<()> {
        if let Some(agent_id) = poison_pill_target(&signal.signal_type) {
            self.handle_poison_pill(agent_id).await;
        }
        for subscription in subscriptions {
            let item = InboxItem::Signal {
                signal: signal.clone(),
                subscription_pattern: subscription.pattern.clone(),
            };
            if let Err(e) = self
                .send(AgentTarget::Id(subscription.agent_id.clone()), item)
                .await
            {
                debug!(
                    agent_id = %subscription.agent_id,
                    signal_type = %signal.signal_type,
                    "Signal not delivered: {}", e
                );
            }
        }
        Ok(())
    }

    async fn handle_poison_pill(&self, agent_id: &str) {
        let Some(handle) = self.handle(agent_id).await else {
            self.kill_if_persisted(agent_id).await;
            return;
        };
        if !handle.record.descriptor.is_evictable() {
            return;
        }

        let _transition = handle.transition.lock().await;
        match handle.evict() {
            EvictionAction::AlreadyDead => {}
            EvictionAction::DieNow => {
                self.persist_dead(&handle.id).await;
                self.finish_death_locked(&handle).await;
            }
            EvictionAction::Deferred => {
                handle.inbox.steer(TERMINATION_MESSAGE);
                self.runtime
                    .events
                    .emit("agent.terminating", json!({ "agentId": handle.id }));
                info!(agent_id = %handle.id, "Poison pill while busy; death deferred to end of current item");
            }
        }
    }

    /// Poison pill for an agent that is not resident.
    async fn kill_if_persisted(&self, agent_id: &str) {
        let storage = &self.runtime.storage;
        let (Ok(Some(record)), Ok(Some(state))) = (
            storage.agent_record_read(agent_id).await,
            storage.agent_state_read(agent_id).await,
        ) else {
            return;
        };
        if record.descriptor.is_evictable() && state.lifecycle != Lifecycle::Dead {
            self.kill_persisted(&record, state).await;
        }
    }

    /// Mark a non-resident agent dead in storage.
    async fn kill_persisted(&self, record: &AgentRecord, mut state: AgentState) {
        state.lifecycle = Lifecycle::Dead;
        state.updated_at = self.now();
        if let Err(e) = self.runtime.storage.agent_state_write(&record.id, &state).await {
            warn!(agent_id = %record.id, "Failed to persist dead state: {}", e);
        }
        self.cancel_lifecycle_timers(&record.id).await;
        self.runtime
            .events
            .emit("agent.dead", json!({ "agentId": record.id }));
        info!(agent_id = %record.id, "Agent evicted");
    }

    async fn persist_dead(&self, agent_id: &str) {
        let storage = &self.runtime.storage;
        match storage.agent_state_read(agent_id).await {
            Ok(Some(mut state)) => {
                state.lifecycle = Lifecycle::Dead;
                state.updated_at = self.now();
                if let Err(e) = storage.agent_state_write(agent_id, &state).await {
                    warn!(agent_id = %agent_id, "Failed to persist dead state: {}", e);
                }
            }
            Ok(None) => warn!(agent_id = %agent_id, "No persisted state to mark dead"),
            Err(e) => warn!(agent_id = %agent_id, "Failed to read state: {}", e),
        }
    }

    /// Finish a death the agent loop applied itself.
    pub(crate) async fn finish_death(&self, handle: &Arc<AgentHandle>) {
        let _transition = handle.transition.lock().await;
        self.finish_death_locked(handle).await;
    }

    /// Reject queued items, close the inbox, drop timers and unregister.
    async fn finish_death_locked(&self, handle: &Arc<AgentHandle>) {
        for entry in handle.inbox.drain_pending() {
            entry.reject(VisorError::AgentDead(handle.id.clone()));
        }
        handle.inbox.close();
        self.cancel_lifecycle_timers(&handle.id).await;
        self.agents.write().await.remove(&handle.id);
        self.runtime
            .events
            .emit("agent.dead", json!({ "agentId": handle.id }));
        info!(agent_id = %handle.id, "Agent evicted");
    }

    /// The loop failed to dequeue; the agent will not run again in this
    /// process.
    pub(crate) async fn mark_stopped(&self, agent_id: &str) {
        let Some(handle) = self.handle(agent_id).await else {
            return;
        };
        handle.mark_stopped();
        for entry in handle.inbox.drain_pending() {
            entry.reject(VisorError::InboxClosed(agent_id.to_string()));
        }
        self.runtime
            .events
            .emit("agent.stopped", json!({ "agentId": agent_id }));
        warn!(agent_id = %agent_id, "Agent loop stopped");
    }

    /// Lifecycle of a resident or persisted agent.
    pub async fn lifecycle(&self, agent_id: &str) -> Result<Option<Lifecycle>> {
        if let Some(handle) = self.handle(agent_id).await {
            return Ok(Some(handle.lifecycle()));
        }
        Ok(self
            .runtime
            .storage
            .agent_state_read(agent_id)
            .await?
            .map(|state| state.lifecycle))
    }

    /// Resident agents ordered by id.
    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .agents
            .read()
            .await
            .values()
            .map(|handle| handle.summary())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Swap in a new configuration once all in-flight handlers finish.
    /// Returns false when nothing changed.
    pub async fn reload(&self, config: Config) -> Result<bool> {
        config.validate()?;
        let mut current = self.runtime.gate.write().await;
        if *current == config {
            return Ok(false);
        }
        *current = config;
        drop(current);
        self.runtime.events.emit("config.reloaded", json!({}));
        log_component!(info, "supervisor", "Configuration reloaded");
        Ok(true)
    }
}
