//! Persisted delayed signals.
//!
//! Entries are stored as one table and rewritten on every change. A single
//! timer task sleeps until the earliest deadline (capped at
//! `scheduler.max_timer_ms`) or until the table changes. Due entries are
//! removed and persisted before their signal is generated: a crash between
//! the two steps loses the delivery instead of repeating it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DelayedSignal, DelayedSignalInput, SignalGenerateInput, Signals};
use crate::config::Config;
use crate::error::{Result, VisorError};
use crate::events::EventBus;
use crate::storage::Storage;
use crate::utils::clock::Clock;

fn delivery_order(a: &DelayedSignal, b: &DelayedSignal) -> std::cmp::Ordering {
    a.deliver_at
        .cmp(&b.deliver_at)
        .then_with(|| a.signal_type.cmp(&b.signal_type))
        .then_with(|| a.id.cmp(&b.id))
}

/// Delayed signal scheduler.
pub struct DelayedSignals {
    storage: Arc<dyn Storage>,
    signals: Arc<Signals>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    gate: Arc<RwLock<Config>>,
    entries: Mutex<Vec<DelayedSignal>>,
    persist_lock: Mutex<()>,
    notify: Arc<Notify>,
    running: AtomicBool,
    loaded: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedSignals {
    /// `gate` is the supervisor's config gate; deliveries run under its read side.
    pub fn new(
        storage: Arc<dyn Storage>,
        signals: Arc<Signals>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        gate: Arc<RwLock<Config>>,
    ) -> Self {
        Self {
            storage,
            signals,
            events,
            clock,
            gate,
            entries: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
            notify: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Replace the in-memory table with the persisted one.
    pub async fn load(&self) -> Result<usize> {
        let stored = self.storage.delayed_load().await?;
        let count = stored.len();
        *self.entries.lock().await = stored;
        self.loaded.store(true, Ordering::SeqCst);
        Ok(count)
    }

    /// Load persisted entries unless already loaded, fire everything already
    /// due, then arm the timer task (idempotent).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.loaded.load(Ordering::SeqCst) {
            let count = self.load().await?;
            info!(entries = count, "Delayed signals loaded");
        }

        if let Err(e) = self.deliver_due().await {
            warn!("Initial delayed delivery failed: {}", e);
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            info!("Delayed signal scheduler started");
            run_timer(weak).await;
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the timer task. Persisted entries stay for the next start.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Schedule a delayed signal. An existing entry with the same
    /// `(type, repeat_key)` is replaced.
    pub async fn schedule(&self, input: DelayedSignalInput) -> Result<DelayedSignal> {
        let signal_type = input.signal_type.trim().to_string();
        if signal_type.is_empty() {
            return Err(VisorError::InvalidInput(
                "delayed signal type must not be empty".to_string(),
            ));
        }
        let repeat_key = match input.repeat_key {
            Some(key) => {
                let key = key.trim().to_string();
                if key.is_empty() {
                    return Err(VisorError::InvalidInput(
                        "repeat key must not be empty when provided".to_string(),
                    ));
                }
                Some(key)
            }
            None => None,
        };

        let now = self.clock.now_ms();
        let entry = DelayedSignal {
            id: Uuid::new_v4().to_string(),
            signal_type,
            deliver_at: input.deliver_at,
            source: input.source.normalized(),
            data: input.data,
            repeat_key,
            created_at: now,
            updated_at: now,
        };

        let inserted = entry.clone();
        let replaced = self
            .mutate(move |entries| {
                let before = entries.len();
                if let Some(key) = inserted.repeat_key.as_deref() {
                    entries.retain(|e| {
                        !(e.signal_type == inserted.signal_type
                            && e.repeat_key.as_deref() == Some(key))
                    });
                }
                let replaced = before - entries.len();
                entries.push(inserted);
                replaced
            })
            .await;

        let replaced = match replaced {
            Ok(replaced) => replaced,
            Err((replaced, e)) => {
                warn!(signal_type = %entry.signal_type, "Failed to persist delayed signal: {}", e);
                replaced
            }
        };

        self.events.emit(
            "signal.delayed.scheduled",
            json!({
                "id": entry.id,
                "type": entry.signal_type,
                "deliverAt": entry.deliver_at,
                "repeatKey": entry.repeat_key,
            }),
        );
        debug!(
            signal_type = %entry.signal_type,
            deliver_at = entry.deliver_at,
            replaced,
            "Delayed signal scheduled"
        );
        self.notify.notify_one();
        Ok(entry)
    }

    /// Cancel every entry with `(signal_type, repeat_key)`. Returns how many
    /// were removed.
    pub async fn cancel_by_repeat_key(&self, signal_type: &str, repeat_key: &str) -> Result<usize> {
        let signal_type = signal_type.trim().to_string();
        let repeat_key = repeat_key.trim().to_string();
        let removed = self
            .mutate(|entries| {
                let before = entries.len();
                entries.retain(|e| {
                    !(e.signal_type == signal_type
                        && e.repeat_key.as_deref() == Some(repeat_key.as_str()))
                });
                before - entries.len()
            })
            .await
            .map_err(|(_, e)| e)?;
        if removed > 0 {
            self.events.emit(
                "signal.delayed.cancelled",
                json!({ "type": signal_type, "repeatKey": repeat_key, "count": removed }),
            );
            self.notify.notify_one();
        }
        Ok(removed)
    }

    /// Cancel one entry by id.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let removed = self
            .mutate(|entries| {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                before != entries.len()
            })
            .await
            .map_err(|(_, e)| e)?;
        if removed {
            self.events
                .emit("signal.delayed.cancelled", json!({ "id": id, "count": 1 }));
            self.notify.notify_one();
        }
        Ok(removed)
    }

    /// All pending entries in delivery order.
    pub async fn list(&self) -> Vec<DelayedSignal> {
        let mut entries = self.entries.lock().await.clone();
        entries.sort_by(delivery_order);
        entries
    }

    /// Deliver every entry whose deadline has passed. Returns how many
    /// signals were generated.
    ///
    /// Runs under the read side of the config gate, so a reload waits for an
    /// in-progress pass.
    pub async fn deliver_due(&self) -> Result<usize> {
        let _gate = self.gate.read().await;
        let now = self.clock.now_ms();
        let mut due: Vec<DelayedSignal> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.deliver_at <= now)
            .cloned()
            .collect();
        due.sort_by(delivery_order);

        let mut delivered = 0;
        for entry in due {
            let id = entry.id.clone();
            let removed = match self
                .mutate(|entries| {
                    let before = entries.len();
                    entries.retain(|e| e.id != id);
                    before != entries.len()
                })
                .await
            {
                Ok(removed) => removed,
                Err((removed, e)) => {
                    if removed {
                        self.entries.lock().await.push(entry.clone());
                    }
                    return Err(e);
                }
            };
            if !removed {
                // Cancelled or replaced since the due scan.
                continue;
            }

            let input = SignalGenerateInput {
                signal_type: entry.signal_type.clone(),
                source: entry.source.clone(),
                data: entry.data.clone(),
            };
            match self.signals.generate(input).await {
                Ok(signal) => {
                    delivered += 1;
                    self.events.emit(
                        "signal.delayed.delivered",
                        json!({ "id": entry.id, "type": entry.signal_type, "signalId": signal.id }),
                    );
                }
                Err(e) => error!(
                    signal_type = %entry.signal_type,
                    "Delayed signal generation failed after removal: {}", e
                ),
            }
        }
        Ok(delivered)
    }

    /// Earliest pending deadline.
    async fn next_deadline(&self) -> Option<i64> {
        self.entries.lock().await.iter().map(|e| e.deliver_at).min()
    }

    /// Apply `f` to the table and persist the result. On a storage failure
    /// the in-memory change is kept and the closure result is returned with
    /// the error.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<DelayedSignal>) -> R,
    ) -> std::result::Result<R, (R, VisorError)> {
        let _persist = self.persist_lock.lock().await;
        let (result, snapshot) = {
            let mut entries = self.entries.lock().await;
            let result = f(&mut entries);
            (result, entries.clone())
        };
        match self.storage.delayed_save(&snapshot).await {
            Ok(()) => Ok(result),
            Err(e) => Err((result, VisorError::Persistence(format!("delayed signals: {}", e)))),
        }
    }
}

impl Drop for DelayedSignals {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn run_timer(scheduler: Weak<DelayedSignals>) {
    loop {
        let Some(this) = scheduler.upgrade() else {
            return;
        };
        if !this.is_running() {
            return;
        }

        let (max_timer_ms, retry_ms) = {
            let config = this.gate.read().await;
            (
                config.scheduler.max_timer_ms,
                config.scheduler.failure_retry_ms,
            )
        };
        let wait_ms = match this.deliver_due().await {
            Ok(_) => match this.next_deadline().await {
                Some(deadline) => {
                    let until = (deadline - this.clock.now_ms()).max(0) as u64;
                    until.min(max_timer_ms)
                }
                None => max_timer_ms,
            },
            Err(e) => {
                error!("Delayed delivery failed, retrying in {}ms: {}", retry_ms, e);
                retry_ms
            }
        };

        let notify = Arc::clone(&this.notify);
        let notified = notify.notified();
        tokio::pin!(notified);
        drop(this);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            _ = &mut notified => {}
        }
    }
}
