//! Signal bus.
//!
//! Agents subscribe to colon-segmented patterns; `generate` appends a signal
//! to the event log and hands every matching subscription to the registered
//! [`SignalDelivery`]. The match set is computed at generation time, but the
//! receiving agent re-checks its subscription when it dequeues the item, so an
//! unsubscribe in between drops the delivery and a re-subscribe restores it.

pub mod delayed;
pub mod pattern;
pub mod types;

pub use delayed::DelayedSignals;
pub use types::{
    DelayedSignal, DelayedSignalInput, Signal, SignalGenerateInput, SignalSource,
    SignalSubscribeInput, SignalSubscription,
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SignalsConfig;
use crate::error::{Result, VisorError};
use crate::events::EventBus;
use crate::storage::Storage;
use crate::utils::clock::Clock;

/// Receives every generated signal with its matching subscriptions, which
/// may be empty.
#[async_trait]
pub trait SignalDelivery: Send + Sync {
    async fn deliver(&self, signal: &Signal, subscriptions: &[SignalSubscription]) -> Result<()>;
}

type SubscriptionKey = (String, String);

/// Pattern subscriptions plus the recent signal log.
pub struct Signals {
    storage: Arc<dyn Storage>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: SignalsConfig,
    subscriptions: RwLock<HashMap<SubscriptionKey, SignalSubscription>>,
    recent: Mutex<VecDeque<Signal>>,
    persist_lock: Mutex<()>,
    delivery: RwLock<Option<Arc<dyn SignalDelivery>>>,
}

impl Signals {
    pub fn new(
        storage: Arc<dyn Storage>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: SignalsConfig,
    ) -> Self {
        Self {
            storage,
            events,
            clock,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            persist_lock: Mutex::new(()),
            delivery: RwLock::new(None),
        }
    }

    /// Install the callback that enqueues matched signals on agents.
    pub async fn set_delivery(&self, delivery: Arc<dyn SignalDelivery>) {
        *self.delivery.write().await = Some(delivery);
    }

    /// Restore subscriptions and the recent log from storage.
    pub async fn load(&self) -> Result<()> {
        let stored = self.storage.subscriptions_load().await?;
        let count = stored.len();
        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.clear();
            for subscription in stored {
                subscriptions.insert(
                    (subscription.agent_id.clone(), subscription.pattern.clone()),
                    subscription,
                );
            }
        }
        let recent = self.storage.signals_recent(self.config.recent_max_limit).await?;
        *self.recent.lock().await = recent.into_iter().collect();
        info!(subscriptions = count, "Signal subscriptions loaded");
        Ok(())
    }

    /// Register or update a subscription.
    pub async fn subscribe(&self, input: SignalSubscribeInput) -> Result<SignalSubscription> {
        let agent_id = input.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(VisorError::InvalidInput(
                "subscription agent id must not be empty".to_string(),
            ));
        }
        let pattern = input.pattern.trim().to_string();
        pattern::validate(&pattern)?;

        let now = self.clock.now_ms();
        let subscription = {
            let mut subscriptions = self.subscriptions.write().await;
            let key = (agent_id.clone(), pattern.clone());
            let created_at = subscriptions.get(&key).map(|s| s.created_at).unwrap_or(now);
            let subscription = SignalSubscription {
                agent_id,
                pattern,
                silent: input.silent.unwrap_or(true),
                user_id: input.user_id,
                created_at,
                updated_at: now,
            };
            subscriptions.insert(key, subscription.clone());
            subscription
        };
        self.persist_subscriptions().await?;
        debug!(
            agent_id = %subscription.agent_id,
            pattern = %subscription.pattern,
            silent = subscription.silent,
            "Signal subscription saved"
        );
        Ok(subscription)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub async fn unsubscribe(&self, agent_id: &str, pattern: &str) -> Result<bool> {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(&(agent_id.trim().to_string(), pattern.trim().to_string()))
            .is_some();
        if removed {
            self.persist_subscriptions().await?;
            debug!(agent_id = %agent_id, pattern = %pattern, "Signal subscription removed");
        }
        Ok(removed)
    }

    pub async fn subscription_get(&self, agent_id: &str, pattern: &str) -> Option<SignalSubscription> {
        self.subscriptions
            .read()
            .await
            .get(&(agent_id.to_string(), pattern.to_string()))
            .cloned()
    }

    /// All subscriptions ordered by agent then pattern.
    pub async fn list_subscriptions(&self) -> Vec<SignalSubscription> {
        let mut list: Vec<SignalSubscription> =
            self.subscriptions.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id).then(a.pattern.cmp(&b.pattern)));
        list
    }

    /// Most recent signals, oldest first.
    pub async fn list_recent(&self, limit: Option<usize>) -> Vec<Signal> {
        let limit = limit
            .unwrap_or(self.config.recent_default_limit)
            .clamp(1, self.config.recent_max_limit.max(1));
        let recent = self.recent.lock().await;
        let start = recent.len().saturating_sub(limit);
        recent.iter().skip(start).cloned().collect()
    }

    /// Record a signal and deliver it to every matching subscriber except
    /// the generating agent.
    pub async fn generate(&self, input: SignalGenerateInput) -> Result<Signal> {
        let signal_type = input.signal_type.trim().to_string();
        if signal_type.is_empty() {
            return Err(VisorError::InvalidInput(
                "signal type must not be empty".to_string(),
            ));
        }

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            signal_type,
            source: input.source.normalized(),
            data: input.data,
            created_at: self.clock.now_ms(),
        };

        if let Err(e) = self.storage.signal_append(&signal).await {
            warn!(signal_id = %signal.id, "Failed to persist signal: {}", e);
        }
        {
            let mut recent = self.recent.lock().await;
            recent.push_back(signal.clone());
            while recent.len() > self.config.recent_max_limit.max(1) {
                recent.pop_front();
            }
        }
        self.events.emit(
            "signal.generated",
            json!({ "id": signal.id, "type": signal.signal_type, "source": signal.source }),
        );

        let matched = self.matching_subscriptions(&signal).await;
        let delivery = self.delivery.read().await.clone();
        match delivery {
            Some(delivery) => delivery.deliver(&signal, &matched).await?,
            None if !matched.is_empty() => warn!(
                signal_type = %signal.signal_type,
                "No signal delivery installed; dropping matches"
            ),
            None => {}
        }

        info!(
            signal_id = %signal.id,
            signal_type = %signal.signal_type,
            source = %signal.source.describe(),
            matched = matched.len(),
            "Signal generated"
        );
        Ok(signal)
    }

    async fn matching_subscriptions(&self, signal: &Signal) -> Vec<SignalSubscription> {
        let source_agent = signal.source.agent_id();
        let subscriptions = self.subscriptions.read().await;
        let mut matched: Vec<SignalSubscription> = subscriptions
            .values()
            .filter(|s| Some(s.agent_id.as_str()) != source_agent)
            .filter(|s| pattern::matches(&s.pattern, &signal.signal_type))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.agent_id.cmp(&b.agent_id).then(a.pattern.cmp(&b.pattern)));
        matched
    }

    async fn persist_subscriptions(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.list_subscriptions().await;
        self.storage
            .subscriptions_save(&snapshot)
            .await
            .map_err(|e| VisorError::Persistence(format!("subscriptions: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::utils::clock::ManualClock;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SignalDelivery for Recorder {
        async fn deliver(&self, signal: &Signal, subscriptions: &[SignalSubscription]) -> Result<()> {
            let mut seen = self.seen.lock().await;
            for subscription in subscriptions {
                seen.push((subscription.agent_id.clone(), signal.signal_type.clone()));
            }
            Ok(())
        }
    }

    async fn bus() -> (Signals, Arc<Recorder>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let signals = Signals::new(
            storage.clone(),
            EventBus::new(),
            Arc::new(ManualClock::new(1_000)),
            SignalsConfig::default(),
        );
        let recorder = Arc::new(Recorder::default());
        signals.set_delivery(recorder.clone()).await;
        (signals, recorder, storage)
    }

    #[tokio::test]
    async fn test_generate_skips_source_agent() {
        let (signals, recorder, _) = bus().await;
        signals
            .subscribe(SignalSubscribeInput::new("a", "build:*:done"))
            .await
            .unwrap();
        signals
            .subscribe(SignalSubscribeInput::new("b", "build:*:done"))
            .await
            .unwrap();

        signals
            .generate(SignalGenerateInput::new(
                "build:alpha:done",
                SignalSource::agent("a", None),
            ))
            .await
            .unwrap();

        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen, vec![("b".to_string(), "build:alpha:done".to_string())]);
    }

    #[tokio::test]
    async fn test_generate_rejects_blank_type() {
        let (signals, _, _) = bus().await;
        let result = signals
            .generate(SignalGenerateInput::new("  ", SignalSource::system()))
            .await;
        assert!(matches!(result, Err(VisorError::InvalidInput(_))));
        assert!(signals.list_recent(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_defaults_silent_and_upserts() {
        let (signals, _, storage) = bus().await;
        let first = signals
            .subscribe(SignalSubscribeInput::new("a", "tick"))
            .await
            .unwrap();
        assert!(first.silent);

        let second = signals
            .subscribe(SignalSubscribeInput::new("a", "tick").silent(false))
            .await
            .unwrap();
        assert!(!second.silent);
        assert_eq!(signals.list_subscriptions().await.len(), 1);
        assert_eq!(storage.subscriptions_load().await.unwrap().len(), 1);

        assert!(signals.unsubscribe("a", "tick").await.unwrap());
        assert!(!signals.unsubscribe("a", "tick").await.unwrap());
        assert!(storage.subscriptions_load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_bad_pattern() {
        let (signals, _, _) = bus().await;
        assert!(signals
            .subscribe(SignalSubscribeInput::new("a", "build::done"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_recent_clamps_limit() {
        let (signals, _, _) = bus().await;
        for i in 0..3 {
            signals
                .generate(SignalGenerateInput::new(&format!("t{}", i), SignalSource::system()))
                .await
                .unwrap();
        }
        assert_eq!(signals.list_recent(Some(0)).await.len(), 1);
        assert_eq!(signals.list_recent(Some(2)).await[1].signal_type, "t2");
        assert_eq!(signals.list_recent(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let (signals, _, storage) = bus().await;
        signals
            .subscribe(SignalSubscribeInput::new("a", "x:*"))
            .await
            .unwrap();
        signals
            .generate(SignalGenerateInput::new("x:1", SignalSource::system()))
            .await
            .unwrap();

        let reloaded = Signals::new(
            storage,
            EventBus::new(),
            Arc::new(ManualClock::new(2_000)),
            SignalsConfig::default(),
        );
        reloaded.load().await.unwrap();
        assert!(reloaded.subscription_get("a", "x:*").await.is_some());
        assert_eq!(reloaded.list_recent(None).await.len(), 1);
    }
}
