//! Agent actor: one task per agent draining its inbox.
//!
//! ```text
//!   post ──▶ Inbox ──▶ next() ──▶ handle item (config read gate held)
//!                                   │
//!                                   ├─ message / system_message / signal
//!                                   │     budget check ─▶ compaction ─▶ ToolLoop
//!                                   ├─ reset / compact / restore
//!                                   ▼
//!                         resolve completion ─▶ pending death? ─▶ sleep if idle
//! ```
//!
//! Items are handled strictly one at a time. A failing handler rejects only
//! its own completion; the loop keeps going. Only a failure to dequeue stops
//! the actor.

use std::sync::{Arc, Weak};

use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::compaction;
use super::context_monitor::{ContextMonitor, Severity, TokenEstimator};
use super::handle::AgentHandle;
use super::history_log::HistoryLog;
use super::inbox::InboxEntry;
use super::tool_loop::ToolLoop;
use super::types::{
    AgentDescriptor, AgentState, CompactionFailure, InboxItem, InboxResult, Lifecycle, MessageContext,
};
use crate::channels::{ConnectorRegistry, OutgoingMessage};
use crate::config::Config;
use crate::error::{Result, VisorError};
use crate::events::EventBus;
use crate::log_component;
use crate::providers::{InferenceContext, InferenceRouter, TokenSnapshot};
use crate::session::{context_from_history, pending_tool_calls, HistoryRecord, Message, ToolCallTermination};
use crate::signals::{Signal, Signals};
use crate::storage::Storage;
use crate::supervisor::{AgentTarget, Supervisor};
use crate::tools::{ToolContext, ToolExecutor};
use crate::utils::clock::Clock;

/// Text recorded when a provider rejects the prompt as too large.
pub const EMERGENCY_RESET_MESSAGE: &str =
    "Emergency reset: context overflow detected. Previous session context was cleared.";

const COMPACTING_NOTICE: &str = "Compacting session context. This may take a moment.";
const RESET_NOTICE: &str = "Session reset.";
const COMPACTED_NOTICE: &str = "Session compacted.";

/// Collaborators shared by every agent of a supervisor.
pub struct AgentRuntime {
    pub storage: Arc<dyn Storage>,
    pub router: Arc<dyn InferenceRouter>,
    pub tools: Arc<dyn ToolExecutor>,
    pub connectors: ConnectorRegistry,
    pub signals: Arc<Signals>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub estimator: Arc<dyn TokenEstimator>,
    /// Reload gate; handlers run under its read side
    pub gate: Arc<RwLock<Config>>,
}

/// How a compaction attempt ended when it did not fail.
enum Compaction {
    Compacted,
    EmptySummary,
}

pub struct Agent {
    handle: Arc<AgentHandle>,
    state: AgentState,
    history: HistoryLog,
    runtime: Arc<AgentRuntime>,
    supervisor: Weak<Supervisor>,
}

impl Agent {
    pub fn new(
        handle: Arc<AgentHandle>,
        state: AgentState,
        runtime: Arc<AgentRuntime>,
        supervisor: Weak<Supervisor>,
    ) -> Self {
        let history = HistoryLog::new(runtime.storage.clone(), runtime.clock.clone(), &handle.id);
        Self {
            handle,
            state,
            history,
            runtime,
            supervisor,
        }
    }

    fn id(&self) -> &str {
        &self.handle.id
    }

    fn descriptor(&self) -> &AgentDescriptor {
        &self.handle.record.descriptor
    }

    /// Drain the inbox until it is closed.
    pub fn run(mut self) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move {
            let inbox = self.handle.inbox.clone();
            if let Err(e) = inbox.attach() {
                error!(agent_id = %self.id(), "Agent loop not started: {}", e);
                return;
            }
            debug!(agent_id = %self.id(), "Agent loop started");

            loop {
                let entry = match inbox.next().await {
                    Ok(entry) => entry,
                    Err(e) => {
                        let quiet = self.handle.lifecycle() == Lifecycle::Dead || self.handle.is_closing();
                        if !quiet {
                            error!(agent_id = %self.id(), "Agent inbox failed: {}", e);
                            if let Some(supervisor) = self.supervisor.upgrade() {
                                supervisor.mark_stopped(self.id()).await;
                            }
                        }
                        break;
                    }
                };

                if !self.handle.begin_item() {
                    entry.reject(VisorError::AgentDead(self.id().to_string()));
                    continue;
                }

                let kind = entry.item.kind();
                let span = tracing::info_span!("agent_item", agent_id = %self.id(), item = kind);
                let InboxEntry { item, completion } = entry;
                let gate = self.runtime.gate.clone();
                let result = async {
                    let config = gate.read().await;
                    self.handle_item(item, &config).await
                }
                .instrument(span)
                .await;

                if let Err(e) = &result {
                    if !e.is_aborted() {
                        warn!(agent_id = %self.id(), item = kind, "Inbox item failed: {}", e);
                    }
                }
                if let Some(completion) = completion {
                    let _ = completion.send(result);
                }

                if self.handle.end_item() {
                    self.die().await;
                    break;
                }

                if let Some(supervisor) = self.supervisor.upgrade() {
                    supervisor.sleep_if_idle(&self.handle, &mut self.state).await;
                }
            }

            inbox.detach();
            debug!(agent_id = %self.id(), "Agent loop exited");
        }
    }

    /// Apply a death that was deferred until the current item finished.
    async fn die(&mut self) {
        self.state.lifecycle = Lifecycle::Dead;
        self.state.updated_at = self.runtime.clock.now_ms();
        self.persist().await;
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.finish_death(&self.handle).await;
        }
    }

    async fn handle_item(&mut self, item: InboxItem, config: &Config) -> Result<InboxResult> {
        if !matches!(item, InboxItem::Restore) && self.state.lifecycle != Lifecycle::Active {
            self.state.lifecycle = Lifecycle::Active;
            self.state.slept_at = None;
            self.persist().await;
        }

        match item {
            InboxItem::Message {
                text,
                files,
                context,
            } => {
                let response_text = self.handle_message(&text, files, &context, config).await?;
                Ok(InboxResult::Message { response_text })
            }
            InboxItem::SystemMessage {
                text,
                origin,
                silent,
                context,
            } => {
                let response_text = self
                    .handle_system_message(&text, &origin, silent, &context, config)
                    .await?;
                Ok(InboxResult::SystemMessage { response_text })
            }
            InboxItem::Signal {
                signal,
                subscription_pattern,
            } => self.handle_signal(&signal, &subscription_pattern, config).await,
            InboxItem::Reset { message, context } => {
                self.handle_reset(message.as_deref(), context.as_ref()).await;
                Ok(InboxResult::Reset { ok: true })
            }
            InboxItem::Compact { context } => Ok(self.handle_compact(context.as_ref(), config).await),
            InboxItem::Restore => {
                self.handle_restore().await?;
                Ok(InboxResult::Restore { ok: true })
            }
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn handle_message(
        &mut self,
        text: &str,
        files: Vec<String>,
        message_context: &MessageContext,
        config: &Config,
    ) -> Result<Option<String>> {
        let system_prompt = self.system_prompt();
        let monitor = ContextMonitor::new(
            config.agents.emergency_context_limit,
            config.agents.compaction_warning_ratio,
            self.runtime.estimator.clone(),
        );
        let request = InferenceContext {
            system_prompt: system_prompt.clone(),
            messages: self.state.context.clone(),
            tools: self.runtime.tools.definitions(),
        };
        let status = monitor.check(&request, text, files.len());

        if status.needs_compaction() {
            log_component!(
                warn,
                "agent",
                "Context budget crossed; compacting before inference",
                agent_id = self.id(),
                estimated = status.estimated,
                limit = status.limit
            );
            if self.descriptor().is_foreground() {
                self.notify_user(COMPACTING_NOTICE, message_context.message_id.clone())
                    .await;
            }
            if self.runtime.router.has_providers() && !self.state.context.is_empty() {
                match self.compact_context(config).await {
                    Ok(Compaction::Compacted) => {}
                    Ok(Compaction::EmptySummary) => {
                        warn!(agent_id = %self.id(), "Compaction returned an empty summary; continuing with full context");
                    }
                    Err(VisorError::Aborted) => return Ok(None),
                    Err(e) => {
                        warn!(agent_id = %self.id(), "Compaction failed; continuing with full context: {}", e);
                    }
                }
            }
        } else if status.severity == Severity::Warning {
            debug!(
                agent_id = %self.id(),
                estimated = status.estimated,
                limit = status.limit,
                "Context budget warning"
            );
        }

        self.history
            .append(HistoryRecord::UserMessage {
                at: self.history.stamp(),
                text: text.to_string(),
                files: files.clone(),
            })
            .await;
        self.state.context.push(Message::user_turn(text, &files));

        let stop_typing = self.start_typing().await;
        let cancel = CancellationToken::new();
        self.handle.set_cancel(Some(cancel.clone()));

        let tool_context = ToolContext::new(self.id())
            .with_user(Some(self.handle.record.user_id.clone()))
            .with_permissions(self.state.permissions.clone());
        let mut usage: Vec<TokenSnapshot> = Vec::new();
        let outcome = {
            let tool_loop = ToolLoop {
                router: self.runtime.router.as_ref(),
                tools: self.runtime.tools.as_ref(),
                tool_context: &tool_context,
                history: &self.history,
                inbox: Some(self.handle.inbox.as_ref()),
                system_prompt: &system_prompt,
                session_id: &self.state.inference_session_id,
                providers: config.agents.default_providers.clone(),
                max_iterations: config.agents.max_tool_iterations,
                cancel,
            };
            let mut context = std::mem::take(&mut self.state.context);
            let outcome = tool_loop.run(&mut context, &mut usage).await;
            self.state.context = context;
            outcome
        };

        self.handle.set_cancel(None);
        if let Some(stop) = stop_typing {
            stop();
        }
        for snapshot in &usage {
            self.state.record_usage(snapshot);
        }
        self.state.updated_at = self.runtime.clock.now_ms();

        match outcome {
            Ok(response) => {
                self.persist().await;
                if let Some(response) = &response {
                    if self.descriptor().is_foreground() {
                        self.notify_user(response, message_context.message_id.clone())
                            .await;
                    }
                }
                Ok(response)
            }
            Err(VisorError::ContextOverflow(detail)) => {
                warn!(agent_id = %self.id(), "Provider reported context overflow: {}", detail);
                let estimated = monitor.estimate_context(&self.state.context);
                self.apply_reset(Some(EMERGENCY_RESET_MESSAGE)).await;
                if self.descriptor().is_foreground() {
                    let notice = format!(
                        "Context overflow: the conversation (~{} tokens) no longer fits the model window. The session was reset; please resend your last message.",
                        estimated
                    );
                    self.notify_user(&notice, message_context.message_id.clone())
                        .await;
                }
                Ok(None)
            }
            Err(VisorError::Aborted) => {
                self.persist().await;
                info!(agent_id = %self.id(), "Inference aborted");
                Ok(None)
            }
            Err(e) => {
                self.persist().await;
                self.report_failure(&e, message_context).await;
                Err(e)
            }
        }
    }

    async fn handle_system_message(
        &mut self,
        text: &str,
        origin: &str,
        silent: bool,
        message_context: &MessageContext,
        config: &Config,
    ) -> Result<Option<String>> {
        let text = system_message_text(text, origin);
        if !silent {
            return self
                .handle_message(&text, Vec::new(), message_context, config)
                .await;
        }
        self.history
            .append(HistoryRecord::UserMessage {
                at: self.history.stamp(),
                text: text.clone(),
                files: Vec::new(),
            })
            .await;
        self.state.context.push(Message::user(&text));
        self.state.updated_at = self.runtime.clock.now_ms();
        self.persist().await;
        Ok(None)
    }

    async fn handle_signal(
        &mut self,
        signal: &Signal,
        subscription_pattern: &str,
        config: &Config,
    ) -> Result<InboxResult> {
        let silent = if subscription_pattern.starts_with("internal.") {
            false
        } else {
            match self
                .runtime
                .signals
                .subscription_get(self.id(), subscription_pattern)
                .await
            {
                Some(subscription) => subscription.silent,
                None => {
                    debug!(
                        agent_id = %self.id(),
                        pattern = %subscription_pattern,
                        signal_type = %signal.signal_type,
                        "Subscription gone before delivery; dropping signal"
                    );
                    return Ok(InboxResult::Signal {
                        delivered: false,
                        response_text: None,
                    });
                }
            }
        };

        let origin = format!("signal:{}", signal.id);
        let response_text = self
            .handle_system_message(
                &signal_text(signal),
                &origin,
                silent,
                &MessageContext::default(),
                config,
            )
            .await?;
        Ok(InboxResult::Signal {
            delivered: true,
            response_text,
        })
    }

    // ------------------------------------------------------------------
    // Reset, compaction, restore
    // ------------------------------------------------------------------

    async fn handle_reset(&mut self, message: Option<&str>, message_context: Option<&MessageContext>) {
        self.apply_reset(message).await;
        if let (AgentDescriptor::User { .. }, Some(message_context)) = (self.descriptor(), message_context) {
            self.notify_user(RESET_NOTICE, message_context.message_id.clone())
                .await;
        }
    }

    /// Clear the context and start a fresh inference session.
    async fn apply_reset(&mut self, message: Option<&str>) {
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        self.state.context = match &message {
            Some(text) => vec![Message::reset_marker(text)],
            None => Vec::new(),
        };
        let previous = std::mem::take(&mut self.state.inference_session_id);
        let mut next = Uuid::new_v4().to_string();
        while next == previous {
            next = Uuid::new_v4().to_string();
        }
        self.state.inference_session_id = next;
        self.state.tokens = None;
        self.state.updated_at = self.runtime.clock.now_ms();

        self.history
            .append(HistoryRecord::Reset {
                at: self.history.stamp(),
                message: message.clone(),
            })
            .await;
        self.persist().await;
        self.runtime.events.emit(
            "agent.reset",
            json!({ "agentId": self.id(), "message": message }),
        );
        info!(agent_id = %self.id(), "Session reset");
    }

    async fn handle_compact(&mut self, message_context: Option<&MessageContext>, config: &Config) -> InboxResult {
        let outcome = if self.state.context.is_empty() {
            Err(CompactionFailure::Empty)
        } else if !self.runtime.router.has_providers() {
            Err(CompactionFailure::NoProvider)
        } else {
            match self.compact_context(config).await {
                Ok(Compaction::Compacted) => Ok(()),
                Ok(Compaction::EmptySummary) => Err(CompactionFailure::EmptySummary),
                Err(VisorError::Aborted) => Err(CompactionFailure::Aborted),
                Err(e) => {
                    warn!(agent_id = %self.id(), "Manual compaction failed: {}", e);
                    Err(CompactionFailure::Failed)
                }
            }
        };

        let result = match outcome {
            Ok(()) => InboxResult::Compact {
                ok: true,
                reason: None,
                text: COMPACTED_NOTICE.to_string(),
            },
            Err(reason) => InboxResult::Compact {
                ok: false,
                reason: Some(reason),
                text: reason.text().to_string(),
            },
        };
        if let (true, Some(message_context), Some(text)) = (
            self.descriptor().is_foreground(),
            message_context,
            result.response_text(),
        ) {
            self.notify_user(text, message_context.message_id.clone())
                .await;
        }
        result
    }

    /// Summarize the context under its own cancellation token. An empty
    /// summary leaves the state untouched.
    async fn compact_context(&mut self, config: &Config) -> Result<Compaction> {
        let cancel = CancellationToken::new();
        self.handle.set_cancel(Some(cancel.clone()));
        let summary = compaction::summarize(
            self.runtime.router.as_ref(),
            &self.state.context,
            &self.state.inference_session_id,
            config.agents.default_providers.clone(),
            cancel,
        )
        .await;
        self.handle.set_cancel(None);
        let summary = summary?;

        if summary.is_empty() {
            return Ok(Compaction::EmptySummary);
        }

        self.state.record_usage(&summary.tokens);
        let at = self.history.stamp();
        for record in compaction::compaction_records(&summary.text, at) {
            self.history.append(record).await;
        }
        self.state.context = compaction::compacted_context(&summary.text);
        self.state.updated_at = self.runtime.clock.now_ms();
        self.persist().await;
        self.runtime.events.emit(
            "agent.compacted",
            json!({ "agentId": self.id(), "summaryTokens": summary.tokens.size.output }),
        );
        info!(agent_id = %self.id(), "Session context compacted");
        Ok(Compaction::Compacted)
    }

    async fn handle_restore(&mut self) -> Result<()> {
        let mut records = self.history.load().await?;
        for call in pending_tool_calls(&records) {
            let record = HistoryRecord::terminated_tool_call(
                &call,
                ToolCallTermination::SessionCrashed,
                self.history.stamp(),
            );
            self.history.append(record.clone()).await;
            records.push(record);
        }
        self.state.context = context_from_history(&records);
        self.persist().await;
        self.runtime
            .events
            .emit("agent.restored", json!({ "agentId": self.id() }));
        debug!(agent_id = %self.id(), messages = self.state.context.len(), "Agent restored from history");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    async fn report_failure(&self, error: &VisorError, message_context: &MessageContext) {
        if self.descriptor().is_foreground() {
            let text = match error {
                VisorError::ToolLoopExceeded(max) => format!(
                    "I stopped after {} tool rounds without finishing. Please narrow the request.",
                    max
                ),
                other => format!("Unexpected error while handling your message: {}", other),
            };
            self.notify_user(&text, message_context.message_id.clone())
                .await;
            return;
        }

        let Some(parent_id) = self.descriptor().parent_agent_id() else {
            return;
        };
        let text = format!(
            "{} {} ({}) failed: {}.",
            self.descriptor().kind(),
            self.descriptor().label(),
            self.id(),
            error
        );
        let Some(supervisor) = self.supervisor.upgrade() else {
            return;
        };
        let item = InboxItem::system_message(&text, &format!("agent:{}", self.id()), false);
        if let Err(e) = supervisor
            .send(AgentTarget::Id(parent_id.to_string()), item)
            .await
        {
            warn!(agent_id = %self.id(), parent_id = %parent_id, "Failed to notify parent agent: {}", e);
        }
    }

    async fn notify_user(&self, text: &str, reply_to: Option<String>) {
        let Some((connector_name, target)) = self.descriptor().connector_target() else {
            return;
        };
        let Some(connector) = self.runtime.connectors.get(connector_name).await else {
            warn!(agent_id = %self.id(), connector = %connector_name, "Connector not registered");
            return;
        };
        if let Err(e) = connector
            .send_message(target, OutgoingMessage::text(text).reply_to(reply_to))
            .await
        {
            warn!(agent_id = %self.id(), connector = %connector_name, "Failed to send message: {}", e);
        }
    }

    async fn start_typing(&self) -> Option<crate::channels::StopTyping> {
        let (connector_name, target) = self.descriptor().connector_target()?;
        let connector = self.runtime.connectors.get(connector_name).await?;
        connector.start_typing(target).await
    }

    async fn persist(&self) {
        if let Err(e) = self
            .runtime
            .storage
            .agent_state_write(self.id(), &self.state)
            .await
        {
            warn!(agent_id = %self.id(), "Failed to persist agent state: {}", e);
        }
    }

    fn system_prompt(&self) -> String {
        match self.descriptor() {
            AgentDescriptor::Permanent { system_prompt, .. } if !system_prompt.trim().is_empty() => {
                system_prompt.clone()
            }
            descriptor => format!(
                "You are the {} agent \"{}\" ({}). Use the signal tools to coordinate with other agents.",
                descriptor.kind(),
                descriptor.label(),
                self.id()
            ),
        }
    }
}

fn system_message_text(text: &str, origin: &str) -> String {
    format!("<system_message origin=\"{}\">\n{}\n</system_message>", origin, text)
}

/// Prompt text for a delivered signal.
pub fn signal_text(signal: &Signal) -> String {
    let mut lines = vec![
        "[signal]".to_string(),
        format!("type: {}", signal.signal_type),
        format!("source: {}", signal.source.describe()),
    ];
    if let Some(data) = &signal.data {
        lines.push(format!("data: {}", data));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalSource;

    #[test]
    fn test_signal_text() {
        let signal = Signal {
            id: "s1".into(),
            signal_type: "build:alpha:done".into(),
            source: SignalSource::agent("a1", None),
            data: Some(json!({"ok": true})),
            created_at: 0,
        };
        assert_eq!(
            signal_text(&signal),
            "[signal]\ntype: build:alpha:done\nsource: agent:a1\ndata: {\"ok\":true}"
        );
    }

    #[test]
    fn test_system_message_wraps_origin() {
        let text = system_message_text("hello", "signal:s1");
        assert!(text.starts_with("<system_message origin=\"signal:s1\">"));
        assert!(text.contains("\nhello\n"));
    }
}
