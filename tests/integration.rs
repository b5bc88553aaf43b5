//! Integration tests for agentvisor
//!
//! These tests drive a real supervisor with scripted inference and a manual
//! clock: lifecycle transitions and poison pills, late-binding signal
//! delivery, context compaction, restart reconciliation and config reloads.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::Semaphore;

use agentvisor::agent::types::{AgentRecord, AgentState, MessageContext};
use agentvisor::agent::{
    AgentDescriptor, CompactionFailure, InboxItem, InboxResult, Lifecycle,
    EMERGENCY_RESET_MESSAGE,
};
use agentvisor::channels::{Connector, ConnectorRegistry, OutgoingMessage};
use agentvisor::config::Config;
use agentvisor::error::{Result, VisorError};
use agentvisor::providers::{
    InferenceContext, InferenceOptions, InferenceResponse, InferenceRouter, Usage,
};
use agentvisor::session::{HistoryRecord, Message, ToolCall};
use agentvisor::signals::{SignalGenerateInput, SignalSource, SignalSubscribeInput};
use agentvisor::storage::{FileStorage, MemoryStorage, Storage};
use agentvisor::supervisor::{AgentTarget, Supervisor, SupervisorBuilder};
use agentvisor::utils::clock::ManualClock;

const T0: i64 = 1_700_000_000_000;
const MINUTE: i64 = 60_000;
const HOUR: i64 = 3_600_000;

/// Requests whose last message contains this marker block until released.
const HOLD: &str = "[hold]";

// ============================================================================
// Fixtures
// ============================================================================

struct TestRouter {
    replies: Mutex<VecDeque<Result<Message>>>,
    requests: Mutex<Vec<InferenceContext>>,
    gate: Semaphore,
    holding: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay_ms: AtomicU64,
}

impl TestRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            holding: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        })
    }

    fn reply(&self, reply: Result<Message>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn requests(&self) -> Vec<InferenceContext> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceRouter for TestRouter {
    async fn complete(
        &self,
        context: &InferenceContext,
        _session_id: &str,
        options: InferenceOptions,
    ) -> Result<InferenceResponse> {
        self.requests.lock().unwrap().push(context.clone());
        let entered = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(entered, Ordering::SeqCst);
        let outcome = self.answer(context, options).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl TestRouter {
    async fn answer(
        &self,
        context: &InferenceContext,
        options: InferenceOptions,
    ) -> Result<InferenceResponse> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let held = context
            .messages
            .last()
            .map(|m| m.content.contains(HOLD))
            .unwrap_or(false);
        if held {
            self.holding.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::select! {
                _ = options.cancel.cancelled() => Err(VisorError::Aborted),
                permit = self.gate.acquire() => {
                    permit.unwrap().forget();
                    Ok(())
                }
            };
            self.holding.fetch_sub(1, Ordering::SeqCst);
            outcome?;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Message::assistant("ok")));
        reply.map(|message| InferenceResponse {
            message,
            provider_id: "test".to_string(),
            model_id: "test-model".to_string(),
            usage: Usage::new(10, 2),
        })
    }
}

#[derive(Default)]
struct RecordingConnector {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingConnector {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn send_message(&self, target_id: &str, message: OutgoingMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target_id.to_string(), message.text));
        Ok(())
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    router: Arc<TestRouter>,
    clock: Arc<ManualClock>,
    connector: Arc<RecordingConnector>,
}

async fn harness_with(config: Config, storage: Arc<dyn Storage>) -> Harness {
    let router = TestRouter::new();
    let clock = Arc::new(ManualClock::new(T0));
    let connector = Arc::new(RecordingConnector::default());
    let connectors = ConnectorRegistry::new();
    connectors.register("rec", connector.clone()).await;
    let supervisor = SupervisorBuilder::new(config)
        .storage(storage)
        .inference(router.clone())
        .connectors(connectors)
        .clock(clock.clone())
        .build()
        .await
        .unwrap();
    Harness {
        supervisor,
        router,
        clock,
        connector,
    }
}

async fn harness() -> Harness {
    harness_with(Config::default(), Arc::new(MemoryStorage::new())).await
}

fn permanent(id: &str) -> AgentDescriptor {
    AgentDescriptor::Permanent {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        system_prompt: String::new(),
        workspace_dir: None,
    }
}

fn subagent(id: &str, parent: &str) -> AgentDescriptor {
    AgentDescriptor::Subagent {
        id: id.to_string(),
        parent_agent_id: parent.to_string(),
        name: "worker".to_string(),
    }
}

fn user(channel: &str) -> AgentDescriptor {
    AgentDescriptor::User {
        connector: "rec".to_string(),
        user_id: "u1".to_string(),
        channel_id: channel.to_string(),
    }
}

fn target(id: &str) -> AgentTarget {
    AgentTarget::Id(id.to_string())
}

async fn settle<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_lifecycle(supervisor: &Supervisor, agent_id: &str, expected: Lifecycle) {
    for _ in 0..400 {
        if supervisor.lifecycle(agent_id).await.unwrap() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never became {}", agent_id, expected);
}

async fn poison_pills(supervisor: &Supervisor, agent_id: &str) -> Vec<i64> {
    let signal_type = format!("agent:{}:poison-pill", agent_id);
    supervisor
        .delayed()
        .list()
        .await
        .into_iter()
        .filter(|e| e.signal_type == signal_type)
        .map(|e| e.deliver_at)
        .collect()
}

async fn wait_poison_pill_at(supervisor: &Supervisor, agent_id: &str, deliver_at: i64) {
    for _ in 0..400 {
        if poison_pills(supervisor, agent_id).await == vec![deliver_at] {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected one poison pill at {}, found {:?}",
        deliver_at,
        poison_pills(supervisor, agent_id).await
    );
}

async fn wait_history<F>(storage: &dyn Storage, agent_id: &str, check: F) -> Vec<HistoryRecord>
where
    F: Fn(&[HistoryRecord]) -> bool,
{
    for _ in 0..400 {
        let records = storage.history_load(agent_id).await.unwrap();
        if check(&records) {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("history of {} never matched", agent_id);
}

fn user_texts(records: &[HistoryRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            HistoryRecord::UserMessage { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

async fn state_of(supervisor: &Supervisor, agent_id: &str) -> AgentState {
    supervisor
        .storage()
        .agent_state_read(agent_id)
        .await
        .unwrap()
        .unwrap()
}

// ============================================================================
// Lifecycle and poison pills
// ============================================================================

#[tokio::test]
async fn test_sleeping_subagent_gets_one_poison_pill() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("parent")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-1", &parent)).await.unwrap();
    assert_eq!(sub, "sub-1");

    let result = h
        .supervisor
        .post_and_await(target(&sub), InboxItem::reset(None))
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Reset { ok: true });

    wait_poison_pill_at(&h.supervisor, &sub, T0 + HOUR).await;
    let idle: Vec<i64> = h
        .supervisor
        .delayed()
        .list()
        .await
        .into_iter()
        .filter(|e| e.signal_type == "agent:sub-1:idle")
        .map(|e| e.deliver_at)
        .collect();
    assert_eq!(idle, vec![T0 + MINUTE]);
    assert_eq!(state_of(&h.supervisor, &sub).await.lifecycle, Lifecycle::Sleeping);
}

#[tokio::test]
async fn test_wake_reschedules_and_pill_kills() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("parent")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-1", &parent)).await.unwrap();

    h.supervisor
        .post_and_await(target(&sub), InboxItem::reset(None))
        .await
        .unwrap();
    wait_poison_pill_at(&h.supervisor, &sub, T0 + HOUR).await;

    // Wake at +30min and fall asleep again.
    h.clock.advance(30 * MINUTE);
    h.supervisor
        .post_and_await(target(&sub), InboxItem::reset(None))
        .await
        .unwrap();
    let slept_at = T0 + 30 * MINUTE;
    wait_poison_pill_at(&h.supervisor, &sub, slept_at + HOUR).await;

    h.clock.set(slept_at + HOUR - 1);
    h.supervisor.delayed().deliver_due().await.unwrap();
    assert_eq!(
        h.supervisor.lifecycle(&sub).await.unwrap(),
        Some(Lifecycle::Sleeping)
    );

    h.clock.set(slept_at + HOUR);
    h.supervisor.delayed().deliver_due().await.unwrap();
    wait_lifecycle(&h.supervisor, &sub, Lifecycle::Dead).await;

    let rejected = h
        .supervisor
        .post(target(&sub), InboxItem::message("still there?"))
        .await;
    assert!(matches!(rejected, Err(VisorError::AgentDead(_))));
    assert!(h
        .supervisor
        .delayed()
        .list()
        .await
        .iter()
        .all(|e| !e.signal_type.starts_with("agent:sub-1:")));
    assert_eq!(state_of(&h.supervisor, &sub).await.lifecycle, Lifecycle::Dead);
}

#[tokio::test]
async fn test_pill_for_busy_agent_defers_death() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("parent")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-1", &parent)).await.unwrap();

    let pending = h
        .supervisor
        .post(target(&sub), InboxItem::message("long job [hold]"))
        .await
        .unwrap();
    let router = h.router.clone();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;

    h.supervisor
        .signals()
        .generate(SignalGenerateInput::new(
            "agent:sub-1:poison-pill",
            SignalSource::system(),
        ))
        .await
        .unwrap();

    let handle = h.supervisor.handle(&sub).await.unwrap();
    assert!(handle.is_terminating());
    assert_eq!(handle.lifecycle(), Lifecycle::Active);
    let rejected = h
        .supervisor
        .post(target(&sub), InboxItem::message("more work"))
        .await;
    assert!(matches!(rejected, Err(VisorError::AgentDead(_))));

    h.router.release();
    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.response_text(), Some("ok"));

    for _ in 0..400 {
        if h.supervisor.handle(&sub).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.supervisor.handle(&sub).await.is_none());
    assert_eq!(state_of(&h.supervisor, &sub).await.lifecycle, Lifecycle::Dead);
    assert!(poison_pills(&h.supervisor, &sub).await.is_empty());
}

#[tokio::test]
async fn test_permanent_agent_ignores_poison_pill() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&permanent("keeper")).await.unwrap();
    h.supervisor
        .post_and_await(target(&agent), InboxItem::reset(None))
        .await
        .unwrap();
    wait_lifecycle(&h.supervisor, &agent, Lifecycle::Sleeping).await;
    assert!(poison_pills(&h.supervisor, &agent).await.is_empty());

    h.supervisor
        .signals()
        .generate(SignalGenerateInput::new(
            "agent:keeper:poison-pill",
            SignalSource::system(),
        ))
        .await
        .unwrap();
    assert_eq!(
        h.supervisor.lifecycle(&agent).await.unwrap(),
        Some(Lifecycle::Sleeping)
    );
}

#[tokio::test]
async fn test_cron_agent_ignores_poison_pill() {
    let h = harness().await;
    let agent = h
        .supervisor
        .resolve(&AgentDescriptor::Cron {
            id: "nightly".to_string(),
        })
        .await
        .unwrap();
    h.supervisor
        .post_and_await(target(&agent), InboxItem::message("tick"))
        .await
        .unwrap();
    wait_lifecycle(&h.supervisor, &agent, Lifecycle::Sleeping).await;
    assert!(poison_pills(&h.supervisor, &agent).await.is_empty());

    h.supervisor
        .signals()
        .generate(SignalGenerateInput::new(
            &format!("agent:{}:poison-pill", agent),
            SignalSource::system(),
        ))
        .await
        .unwrap();

    let handle = h.supervisor.handle(&agent).await.unwrap();
    assert!(!handle.is_terminating());
    assert_eq!(handle.lifecycle(), Lifecycle::Sleeping);
    assert_eq!(state_of(&h.supervisor, &agent).await.lifecycle, Lifecycle::Sleeping);
    let result = h
        .supervisor
        .post_and_await(target(&agent), InboxItem::message("tock"))
        .await
        .unwrap();
    assert_eq!(result.response_text(), Some("ok"));
}

#[tokio::test]
async fn test_post_to_unknown_agent() {
    let h = harness().await;
    let result = h
        .supervisor
        .post(target("nobody"), InboxItem::message("hi"))
        .await;
    assert!(matches!(result, Err(VisorError::AgentNotFound(_))));
}

#[tokio::test]
async fn test_lifecycle_signals_reach_subscribers() {
    let h = harness().await;
    let observer = h.supervisor.resolve(&permanent("observer")).await.unwrap();
    let worker = h.supervisor.resolve(&permanent("worker")).await.unwrap();
    h.supervisor
        .signals()
        .subscribe(SignalSubscribeInput::new(&observer, "agent:*:sleep").silent(true))
        .await
        .unwrap();

    h.supervisor
        .post_and_await(target(&worker), InboxItem::reset(None))
        .await
        .unwrap();

    let storage = h.supervisor.storage().clone();
    let records = wait_history(storage.as_ref(), &observer, |records| {
        user_texts(records)
            .iter()
            .any(|t| t.contains("type: agent:worker:sleep"))
    })
    .await;
    // The observer's own sleep is never delivered back to it.
    assert!(!user_texts(&records)
        .iter()
        .any(|t| t.contains("type: agent:observer:sleep")));
}

// ============================================================================
// Signal delivery
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_before_dequeue_drops_signal() {
    let h = harness().await;
    let alpha = h.supervisor.resolve(&permanent("alpha")).await.unwrap();
    let beta = h.supervisor.resolve(&permanent("beta")).await.unwrap();
    let storage = h.supervisor.storage().clone();
    let router = h.router.clone();

    let busy = h
        .supervisor
        .post(target(&beta), InboxItem::message("busy [hold]"))
        .await
        .unwrap();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;

    let signals = h.supervisor.signals();
    signals
        .subscribe(SignalSubscribeInput::new(&beta, "build:*:done").silent(true))
        .await
        .unwrap();
    signals
        .generate(SignalGenerateInput::new(
            "build:alpha:done",
            SignalSource::agent(&alpha, None),
        ))
        .await
        .unwrap();
    assert!(signals.unsubscribe(&beta, "build:*:done").await.unwrap());

    h.router.release();
    busy.await.unwrap().unwrap();
    wait_lifecycle(&h.supervisor, &beta, Lifecycle::Sleeping).await;
    let records = storage.history_load(&beta).await.unwrap();
    assert!(!user_texts(&records).iter().any(|t| t.contains("[signal]")));

    // Re-subscribing before the dequeue delivers again.
    let busy = h
        .supervisor
        .post(target(&beta), InboxItem::message("busy again [hold]"))
        .await
        .unwrap();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;
    signals
        .subscribe(SignalSubscribeInput::new(&beta, "build:*:done").silent(true))
        .await
        .unwrap();
    signals
        .generate(SignalGenerateInput::new(
            "build:alpha:done",
            SignalSource::agent(&alpha, None),
        ))
        .await
        .unwrap();
    signals.unsubscribe(&beta, "build:*:done").await.unwrap();
    signals
        .subscribe(SignalSubscribeInput::new(&beta, "build:*:done").silent(true))
        .await
        .unwrap();

    h.router.release();
    busy.await.unwrap().unwrap();
    wait_history(storage.as_ref(), &beta, |records| {
        user_texts(records)
            .iter()
            .any(|t| t.contains("[signal]") && t.contains("type: build:alpha:done"))
    })
    .await;
}

#[tokio::test]
async fn test_generator_does_not_receive_own_signal() {
    let h = harness().await;
    let alpha = h.supervisor.resolve(&permanent("alpha")).await.unwrap();
    let beta = h.supervisor.resolve(&permanent("beta")).await.unwrap();
    let signals = h.supervisor.signals();
    for agent in [&alpha, &beta] {
        signals
            .subscribe(SignalSubscribeInput::new(agent, "deploy:*").silent(true))
            .await
            .unwrap();
    }

    signals
        .generate(SignalGenerateInput::new(
            "deploy:prod",
            SignalSource::agent(&alpha, None),
        ))
        .await
        .unwrap();

    let storage = h.supervisor.storage().clone();
    wait_history(storage.as_ref(), &beta, |records| {
        user_texts(records).iter().any(|t| t.contains("deploy:prod"))
    })
    .await;
    let records = storage.history_load(&alpha).await.unwrap();
    assert!(!user_texts(&records).iter().any(|t| t.contains("deploy:prod")));
}

#[tokio::test]
async fn test_subagent_failure_notifies_parent() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("lead")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-9", &parent)).await.unwrap();
    h.router
        .reply(Err(VisorError::Inference("provider down".to_string())));

    let result = h
        .supervisor
        .post_and_await(target(&sub), InboxItem::message("do it"))
        .await;
    assert!(matches!(result, Err(VisorError::Inference(_))));

    let storage = h.supervisor.storage().clone();
    let records = wait_history(storage.as_ref(), &parent, |records| {
        user_texts(records)
            .iter()
            .any(|t| t.contains("subagent worker (sub-9) failed:"))
    })
    .await;
    let report = user_texts(&records)
        .into_iter()
        .find(|t| t.contains("failed:"))
        .unwrap();
    assert!(report.starts_with("<system_message origin=\"agent:sub-9\">"));
    assert!(report.contains("provider down"));
}

#[tokio::test]
async fn test_queued_failure_reports_merge() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("lead")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-9", &parent)).await.unwrap();
    let router = h.router.clone();

    let busy = h
        .supervisor
        .post(target(&parent), InboxItem::message("planning [hold]"))
        .await
        .unwrap();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;

    for attempt in ["first outage", "second outage"] {
        h.router.reply(Err(VisorError::Inference(attempt.to_string())));
        let result = h
            .supervisor
            .post_and_await(target(&sub), InboxItem::message("do it"))
            .await;
        assert!(result.is_err());
    }
    let handle = h.supervisor.handle(&parent).await.unwrap();
    assert_eq!(handle.inbox.size(), 1);

    h.router.release();
    busy.await.unwrap().unwrap();
    let storage = h.supervisor.storage().clone();
    let records = wait_history(storage.as_ref(), &parent, |records| {
        user_texts(records).iter().any(|t| t.contains("failed:"))
    })
    .await;
    let reports: Vec<String> = user_texts(&records)
        .into_iter()
        .filter(|t| t.contains("failed:"))
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("first outage"));
    assert!(reports[0].contains("second outage"));
}

// ============================================================================
// Context budget and compaction
// ============================================================================

fn tiny_budget() -> Config {
    let mut config = Config::default();
    config.agents.emergency_context_limit = 10;
    config
}

#[tokio::test]
async fn test_compaction_before_inference() {
    let h = harness_with(tiny_budget(), Arc::new(MemoryStorage::new())).await;
    let agent = h.supervisor.resolve(&permanent("writer")).await.unwrap();
    h.router.reply(Ok(Message::assistant("r1")));
    h.router.reply(Ok(Message::assistant("  checkpoint summary  ")));
    h.router.reply(Ok(Message::assistant("r2")));

    let first = h
        .supervisor
        .post_and_await(target(&agent), InboxItem::message("hello"))
        .await
        .unwrap();
    assert_eq!(first.response_text(), Some("r1"));
    let second = h
        .supervisor
        .post_and_await(target(&agent), InboxItem::message("again"))
        .await
        .unwrap();
    assert_eq!(second.response_text(), Some("r2"));

    let requests = h.router.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1]
        .messages
        .last()
        .unwrap()
        .content
        .contains("Summarize the conversation"));
    assert!(requests[1].tools.is_empty());
    let after = &requests[2].messages;
    assert_eq!(after.len(), 3);
    assert!(after[0].is_reset_marker());
    assert!(after[1].content.starts_with("checkpoint summary"));
    assert_eq!(after[2].content, "again");

    let records = h.supervisor.storage().history_load(&agent).await.unwrap();
    let reset_at = records
        .iter()
        .find_map(|r| match r {
            HistoryRecord::Reset { at, message: Some(_) } => Some(*at),
            _ => None,
        })
        .unwrap();
    let summary_at = records
        .iter()
        .find_map(|r| match r {
            HistoryRecord::UserMessage { at, text, .. } if text.starts_with("checkpoint summary") => {
                Some(*at)
            }
            _ => None,
        })
        .unwrap();
    let turn_at = records
        .iter()
        .find_map(|r| match r {
            HistoryRecord::UserMessage { at, text, .. } if text == "again" => Some(*at),
            _ => None,
        })
        .unwrap();
    assert_eq!(reset_at, summary_at);
    assert!(turn_at > summary_at);

    let state = state_of(&h.supervisor, &agent).await;
    assert_eq!(state.context.len(), 4);
    assert!(state.context[0].is_reset_marker());
    assert_eq!(state.context[3].content, "r2");
}

#[tokio::test]
async fn test_empty_summary_keeps_context() {
    let h = harness_with(tiny_budget(), Arc::new(MemoryStorage::new())).await;
    let agent = h.supervisor.resolve(&permanent("writer")).await.unwrap();
    h.router.reply(Ok(Message::assistant("r1")));
    h.router.reply(Ok(Message::assistant("   ")));
    h.router.reply(Ok(Message::assistant("r2")));

    h.supervisor
        .post_and_await(target(&agent), InboxItem::message("hello"))
        .await
        .unwrap();
    h.supervisor
        .post_and_await(target(&agent), InboxItem::message("again"))
        .await
        .unwrap();

    let state = state_of(&h.supervisor, &agent).await;
    let contents: Vec<&str> = state.context.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "r1", "again", "r2"]);
    let records = h.supervisor.storage().history_load(&agent).await.unwrap();
    assert!(!records
        .iter()
        .any(|r| matches!(r, HistoryRecord::Reset { .. })));
}

#[tokio::test]
async fn test_empty_summary_compact_keeps_state() {
    let h = harness().await;
    let parent = h.supervisor.resolve(&permanent("lead")).await.unwrap();
    let sub = h.supervisor.resolve(&subagent("sub-3", &parent)).await.unwrap();
    h.supervisor
        .post_and_await(target(&sub), InboxItem::message("hello"))
        .await
        .unwrap();
    wait_poison_pill_at(&h.supervisor, &sub, T0 + HOUR).await;
    let before = state_of(&h.supervisor, &sub).await;
    assert_eq!(before.slept_at, Some(T0));

    h.clock.advance(5 * MINUTE);
    h.router.reply(Ok(Message::assistant("   ")));
    let result = h
        .supervisor
        .post_and_await(target(&sub), InboxItem::compact())
        .await
        .unwrap();
    assert_eq!(
        result,
        InboxResult::Compact {
            ok: false,
            reason: Some(CompactionFailure::EmptySummary),
            text: CompactionFailure::EmptySummary.text().to_string(),
        }
    );

    // Falling asleep again moves only the pill.
    wait_poison_pill_at(&h.supervisor, &sub, T0 + 5 * MINUTE + HOUR).await;
    let after = state_of(&h.supervisor, &sub).await;
    assert_eq!(after.context, before.context);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.slept_at, Some(T0 + 5 * MINUTE));
}

#[tokio::test]
async fn test_provider_overflow_resets_session() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&user("chat-1")).await.unwrap();
    let before = state_of(&h.supervisor, &agent).await;
    h.router.reply(Err(VisorError::ContextOverflow(
        "prompt is too long".to_string(),
    )));

    let result = h
        .supervisor
        .post_and_await(target(&agent), InboxItem::message("huge request"))
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Message { response_text: None });

    let state = state_of(&h.supervisor, &agent).await;
    assert_eq!(state.context.len(), 1);
    assert!(state.context[0].is_reset_marker());
    assert!(state.context[0].content.contains(EMERGENCY_RESET_MESSAGE));
    assert_ne!(state.inference_session_id, before.inference_session_id);
    assert!(state.tokens.is_none());
    assert!(h
        .connector
        .texts()
        .iter()
        .any(|t| t.starts_with("Context overflow")));
}

#[tokio::test]
async fn test_manual_compact_on_empty_context() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&permanent("quiet")).await.unwrap();
    let result = h
        .supervisor
        .post_and_await(target(&agent), InboxItem::compact())
        .await
        .unwrap();
    assert_eq!(
        result,
        InboxResult::Compact {
            ok: false,
            reason: Some(CompactionFailure::Empty),
            text: CompactionFailure::Empty.text().to_string(),
        }
    );
}

// ============================================================================
// Messages, reset and abort
// ============================================================================

#[tokio::test]
async fn test_foreground_reply_and_reset_notice() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&user("chat-7")).await.unwrap();
    assert_eq!(h.supervisor.resolve(&user("chat-7")).await.unwrap(), agent);

    let result = h
        .supervisor
        .post_and_await(AgentTarget::from(user("chat-7")), InboxItem::message("hi"))
        .await
        .unwrap();
    assert_eq!(result.response_text(), Some("ok"));

    let reset = InboxItem::Reset {
        message: Some("  start over  ".to_string()),
        context: Some(MessageContext {
            message_id: Some("m1".to_string()),
        }),
    };
    let before = state_of(&h.supervisor, &agent).await;
    h.supervisor
        .post_and_await(target(&agent), reset)
        .await
        .unwrap();

    let sent = h.connector.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            ("chat-7".to_string(), "ok".to_string()),
            ("chat-7".to_string(), "Session reset.".to_string()),
        ]
    );
    let state = state_of(&h.supervisor, &agent).await;
    assert_eq!(state.context, vec![Message::reset_marker("start over")]);
    assert_ne!(state.inference_session_id, before.inference_session_id);
}

#[tokio::test]
async fn test_items_run_one_at_a_time() {
    let h = harness().await;
    h.router.delay_ms.store(20, Ordering::SeqCst);
    let agent = h.supervisor.resolve(&permanent("serial")).await.unwrap();

    let first = h
        .supervisor
        .post(target(&agent), InboxItem::message("one"))
        .await
        .unwrap();
    let second = h
        .supervisor
        .post(target(&agent), InboxItem::message("two"))
        .await
        .unwrap();
    let third = h
        .supervisor
        .post(target(&agent), InboxItem::compact())
        .await
        .unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    third.await.unwrap().unwrap();

    assert_eq!(h.router.max_in_flight.load(Ordering::SeqCst), 1);
    let records = h.supervisor.storage().history_load(&agent).await.unwrap();
    assert_eq!(user_texts(&records)[..2], ["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn test_consecutive_resets_rotate_session() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&permanent("fresh")).await.unwrap();
    let mut sessions = vec![state_of(&h.supervisor, &agent).await.inference_session_id];
    for _ in 0..2 {
        h.supervisor
            .post_and_await(target(&agent), InboxItem::reset(None))
            .await
            .unwrap();
        sessions.push(state_of(&h.supervisor, &agent).await.inference_session_id);
    }

    assert_ne!(sessions[0], sessions[1]);
    assert_ne!(sessions[1], sessions[2]);
    assert_ne!(sessions[0], sessions[2]);
}

#[tokio::test]
async fn test_abort_ends_turn_without_reply() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&permanent("slow")).await.unwrap();
    let pending = h
        .supervisor
        .post(target(&agent), InboxItem::message("think hard [hold]"))
        .await
        .unwrap();
    let router = h.router.clone();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;

    assert!(h.supervisor.abort(&agent).await.unwrap());
    let result = pending.await.unwrap().unwrap();
    assert_eq!(result, InboxResult::Message { response_text: None });

    let records = h.supervisor.storage().history_load(&agent).await.unwrap();
    assert!(!records
        .iter()
        .any(|r| matches!(r, HistoryRecord::AssistantMessage { .. })));
}

// ============================================================================
// Configuration reload
// ============================================================================

#[tokio::test]
async fn test_reload_waits_for_running_handler() {
    let h = harness().await;
    let agent = h.supervisor.resolve(&permanent("busy")).await.unwrap();
    let pending = h
        .supervisor
        .post(target(&agent), InboxItem::message("work [hold]"))
        .await
        .unwrap();
    let router = h.router.clone();
    settle("held request", || router.holding.load(Ordering::SeqCst) == 1).await;

    let mut next = Config::default();
    next.agents.max_tool_iterations = 5;
    let supervisor = h.supervisor.clone();
    let reload = tokio::spawn(async move { supervisor.reload(next).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reload.is_finished());

    h.router.release();
    pending.await.unwrap().unwrap();
    assert!(reload.await.unwrap().unwrap());
    assert_eq!(h.supervisor.config().await.agents.max_tool_iterations, 5);

    let same = h.supervisor.config().await;
    assert!(!h.supervisor.reload(same).await.unwrap());
}

#[tokio::test]
async fn test_reload_rejects_invalid_config() {
    let h = harness().await;
    let mut bad = Config::default();
    bad.agents.emergency_context_limit = 0;
    assert!(h.supervisor.reload(bad).await.is_err());
    assert_eq!(
        h.supervisor.config().await.agents.emergency_context_limit,
        Config::default().agents.emergency_context_limit
    );
}

// ============================================================================
// Restart
// ============================================================================

fn record(id: &str, descriptor: AgentDescriptor) -> AgentRecord {
    AgentRecord {
        id: id.to_string(),
        user_id: "owner-1".to_string(),
        descriptor,
        created_at: T0 - 3 * HOUR,
    }
}

fn state(lifecycle: Lifecycle, updated_at: i64) -> AgentState {
    let mut state = AgentState::new(
        permanent("x").default_permissions(Path::new("/tmp/agent")),
        uuid::Uuid::new_v4().to_string(),
        T0 - 3 * HOUR,
    );
    state.lifecycle = lifecycle;
    state.updated_at = updated_at;
    state
}

async fn seed(storage: &dyn Storage, record: AgentRecord, state: AgentState) {
    storage.agent_record_write(&record).await.unwrap();
    storage.agent_state_write(&record.id, &state).await.unwrap();
    storage
        .history_append(&record.id, &HistoryRecord::Start { at: record.created_at })
        .await
        .unwrap();
}

fn file_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = Some(dir.to_string_lossy().to_string());
    config
}

#[tokio::test]
async fn test_restart_reconciles_sleeping_workers() {
    let dir = tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
    seed(
        storage.as_ref(),
        record("lead", permanent("lead")),
        state(Lifecycle::Active, T0 - 3 * HOUR),
    )
    .await;
    seed(
        storage.as_ref(),
        record("old", subagent("old", "lead")),
        state(Lifecycle::Sleeping, T0 - 2 * HOUR),
    )
    .await;
    // The deadline counts from the recorded sleep, not the last state change.
    let recent_at = T0 - 30 * MINUTE;
    let mut recent = state(Lifecycle::Sleeping, T0 - 3 * HOUR);
    recent.slept_at = Some(recent_at);
    seed(
        storage.as_ref(),
        record("recent", subagent("recent", "lead")),
        recent,
    )
    .await;

    let h = harness_with(file_config(dir.path()), storage.clone()).await;
    h.supervisor.start().await.unwrap();

    assert_eq!(
        storage.agent_state_read("old").await.unwrap().unwrap().lifecycle,
        Lifecycle::Dead
    );
    assert!(h.supervisor.handle("old").await.is_none());
    assert!(poison_pills(&h.supervisor, "old").await.is_empty());
    assert_eq!(poison_pills(&h.supervisor, "recent").await, vec![recent_at + HOUR]);
    assert_eq!(
        h.supervisor.lifecycle("recent").await.unwrap(),
        Some(Lifecycle::Sleeping)
    );

    let dead = h
        .supervisor
        .post(target("old"), InboxItem::message("hello?"))
        .await;
    assert!(matches!(dead, Err(VisorError::AgentDead(_))));

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_restore_closes_interrupted_tool_calls() {
    let dir = tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
    seed(
        storage.as_ref(),
        record("lead", permanent("lead")),
        state(Lifecycle::Active, T0 - HOUR),
    )
    .await;
    for entry in [
        HistoryRecord::UserMessage {
            at: T0 - HOUR + 1,
            text: "ping the host".to_string(),
            files: Vec::new(),
        },
        HistoryRecord::AssistantMessage {
            at: T0 - HOUR + 2,
            text: String::new(),
            tool_calls: vec![ToolCall::new("call-1", "ping", "{}")],
            tokens: None,
        },
    ] {
        storage.history_append("lead", &entry).await.unwrap();
    }

    let h = harness_with(file_config(dir.path()), storage.clone()).await;
    h.supervisor.start().await.unwrap();

    let records = wait_history(storage.as_ref(), "lead", |records| {
        records
            .iter()
            .any(|r| matches!(r, HistoryRecord::ToolResult { tool_call_id, .. } if tool_call_id == "call-1"))
    })
    .await;
    let output = records
        .iter()
        .find_map(|r| match r {
            HistoryRecord::ToolResult { output, is_error, .. } => Some((output.clone(), *is_error)),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        output,
        (
            "Tool call ping (call-1) did not complete: session_crashed".to_string(),
            true
        )
    );

    h.supervisor
        .post_and_await(target("lead"), InboxItem::message("try again"))
        .await
        .unwrap();
    let requests = h.router.requests();
    let closing = requests[0]
        .messages
        .iter()
        .filter(|m| m.tool_call_id.as_deref() == Some("call-1"))
        .count();
    assert_eq!(closing, 1);
    let records = storage.history_load("lead").await.unwrap();
    let results = records
        .iter()
        .filter(|r| matches!(r, HistoryRecord::ToolResult { .. }))
        .count();
    assert_eq!(results, 1);

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_restore_replays_attached_files() {
    let dir = tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
    let live = {
        let h = harness_with(file_config(dir.path()), storage.clone()).await;
        h.supervisor.start().await.unwrap();
        let agent = h.supervisor.resolve(&permanent("viewer")).await.unwrap();
        let item = InboxItem::Message {
            text: "look".to_string(),
            files: vec!["a.png".to_string()],
            context: MessageContext::default(),
        };
        h.supervisor.post_and_await(target(&agent), item).await.unwrap();
        wait_lifecycle(&h.supervisor, &agent, Lifecycle::Sleeping).await;
        h.supervisor.stop().await;
        state_of(&h.supervisor, &agent).await.context
    };
    assert_eq!(live[0].content, "look\n\n[files]\na.png");

    let h = harness_with(file_config(dir.path()), storage.clone()).await;
    h.supervisor.start().await.unwrap();
    h.supervisor
        .post_and_await(target("viewer"), InboxItem::message("and now?"))
        .await
        .unwrap();
    let requests = h.router.requests();
    assert_eq!(requests[0].messages[..live.len()], live[..]);

    h.supervisor.stop().await;
}
