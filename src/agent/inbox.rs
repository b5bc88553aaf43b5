//! Per-agent FIFO inbox.
//!
//! Producers never block: `post` and `send` push under a short lock and wake
//! the consumer. Exactly one consumer (the agent loop) attaches at a time.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{oneshot, Notify};

use super::types::{InboxItem, InboxResult};
use crate::error::{Result, VisorError};

/// Sender half of a completion handle.
pub type Completion = oneshot::Sender<Result<InboxResult>>;

/// Receiver half returned to the poster.
pub type CompletionHandle = oneshot::Receiver<Result<InboxResult>>;

/// A queued item with its optional completion handle.
#[derive(Debug)]
pub struct InboxEntry {
    pub item: InboxItem,
    pub completion: Option<Completion>,
}

impl InboxEntry {
    pub fn resolve(self, result: Result<InboxResult>) {
        if let Some(completion) = self.completion {
            // The poster may have stopped waiting.
            let _ = completion.send(result);
        }
    }

    pub fn reject(self, error: VisorError) {
        self.resolve(Err(error));
    }
}

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<InboxEntry>,
    attached: bool,
    closed: bool,
    steering: Option<String>,
}

/// FIFO inbox of one agent.
#[derive(Debug)]
pub struct Inbox {
    agent_id: String,
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state: Mutex::new(InboxState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `item` and return a handle resolved once it is handled.
    pub fn post(&self, item: InboxItem) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        self.lock().queue.push_back(InboxEntry {
            item,
            completion: Some(tx),
        });
        self.notify.notify_one();
        rx
    }

    /// Enqueue `item` ahead of everything already pending.
    pub fn post_front(&self, item: InboxItem) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        self.lock().queue.push_front(InboxEntry {
            item,
            completion: Some(tx),
        });
        self.notify.notify_one();
        rx
    }

    /// Enqueue without a completion handle. A message is merged into a
    /// pending detached message of the same kind at the tail; system
    /// messages merge only when origin and silence match.
    pub fn send(&self, item: InboxItem) {
        {
            let mut state = self.lock();
            let unmerged = match state.queue.back_mut() {
                Some(InboxEntry {
                    item: pending,
                    completion: None,
                }) => merge(pending, item),
                _ => Some(item),
            };
            if let Some(item) = unmerged {
                state.queue.push_back(InboxEntry {
                    item,
                    completion: None,
                });
            }
        }
        self.notify.notify_one();
    }

    /// Wait for the next entry. Fails once the inbox is closed and empty.
    pub async fn next(&self) -> Result<InboxEntry> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(entry) = state.queue.pop_front() {
                    return Ok(entry);
                }
                if state.closed {
                    return Err(VisorError::InboxClosed(self.agent_id.clone()));
                }
            }
            notified.await;
        }
    }

    /// Register the consumer loop.
    pub fn attach(&self) -> Result<()> {
        let mut state = self.lock();
        if state.attached {
            return Err(VisorError::InvalidInput(format!(
                "inbox of agent {} already has a consumer",
                self.agent_id
            )));
        }
        state.attached = true;
        Ok(())
    }

    pub fn detach(&self) {
        self.lock().attached = false;
    }

    /// Wake the consumer and make `next` fail once the queue is empty.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn size(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Remove and return every pending entry.
    pub fn drain_pending(&self) -> Vec<InboxEntry> {
        self.lock().queue.drain(..).collect()
    }

    /// Leave an instruction for the next inference turn. Replaces any
    /// unconsumed one.
    pub fn steer(&self, text: &str) {
        self.lock().steering = Some(text.to_string());
    }

    pub fn consume_steering(&self) -> Option<String> {
        self.lock().steering.take()
    }
}

/// Fold `item` into `pending`, or hand it back when the two don't merge.
fn merge(pending: &mut InboxItem, item: InboxItem) -> Option<InboxItem> {
    match (pending, item) {
        (
            InboxItem::Message {
                text: pending_text,
                files: pending_files,
                context: pending_context,
            },
            InboxItem::Message {
                text,
                files,
                context,
            },
        ) => {
            pending_text.push('\n');
            pending_text.push_str(&text);
            pending_files.extend(files);
            *pending_context = context;
            None
        }
        (
            InboxItem::SystemMessage {
                text: pending_text,
                origin: pending_origin,
                silent: pending_silent,
                ..
            },
            InboxItem::SystemMessage {
                text, origin, silent, ..
            },
        ) if *pending_origin == origin && *pending_silent == silent => {
            pending_text.push('\n');
            pending_text.push_str(&text);
            None
        }
        (_, item) => Some(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let inbox = Inbox::new("a");
        let _first = inbox.post(InboxItem::message("one"));
        let _second = inbox.post(InboxItem::message("two"));
        let first = inbox.next().await.unwrap();
        let second = inbox.next().await.unwrap();
        assert_eq!(first.item, InboxItem::message("one"));
        assert_eq!(second.item, InboxItem::message("two"));
    }

    #[tokio::test]
    async fn test_next_waits_for_post() {
        let inbox = Arc::new(Inbox::new("a"));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.next().await.map(|e| e.item) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.send(InboxItem::compact());
        let item = consumer.await.unwrap().unwrap();
        assert_eq!(item, InboxItem::compact());
    }

    #[tokio::test]
    async fn test_completion_resolves() {
        let inbox = Inbox::new("a");
        let handle = inbox.post(InboxItem::reset(None));
        let entry = inbox.next().await.unwrap();
        entry.resolve(Ok(InboxResult::Reset { ok: true }));
        assert_eq!(handle.await.unwrap().unwrap(), InboxResult::Reset { ok: true });
    }

    #[test]
    fn test_send_merges_plain_messages() {
        let inbox = Inbox::new("a");
        inbox.send(InboxItem::message("hello"));
        inbox.send(InboxItem::message("world"));
        assert_eq!(inbox.size(), 1);
        match inbox.drain_pending().remove(0).item {
            InboxItem::Message { text, .. } => assert_eq!(text, "hello\nworld"),
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_send_merges_system_messages_from_same_origin() {
        let inbox = Inbox::new("a");
        inbox.send(InboxItem::system_message("first", "agent:s1", false));
        inbox.send(InboxItem::system_message("second", "agent:s1", false));
        inbox.send(InboxItem::system_message("other", "agent:s2", false));
        inbox.send(InboxItem::system_message("quiet", "agent:s2", true));

        let items: Vec<InboxItem> = inbox.drain_pending().into_iter().map(|e| e.item).collect();
        assert_eq!(items.len(), 3);
        match &items[0] {
            InboxItem::SystemMessage { text, origin, .. } => {
                assert_eq!(text, "first\nsecond");
                assert_eq!(origin, "agent:s1");
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_signals_never_merge() {
        let inbox = Inbox::new("a");
        inbox.send(InboxItem::compact());
        inbox.send(InboxItem::compact());
        assert_eq!(inbox.size(), 2);
    }

    #[test]
    fn test_awaited_messages_never_merge() {
        let inbox = Inbox::new("a");
        let _handle = inbox.post(InboxItem::message("hello"));
        inbox.send(InboxItem::message("world"));
        assert_eq!(inbox.size(), 2);
    }

    #[tokio::test]
    async fn test_post_front_jumps_queue() {
        let inbox = Inbox::new("a");
        inbox.send(InboxItem::message("later"));
        let _handle = inbox.post_front(InboxItem::Restore);
        assert_eq!(inbox.next().await.unwrap().item, InboxItem::Restore);
    }

    #[test]
    fn test_attach_is_exclusive() {
        let inbox = Inbox::new("a");
        inbox.attach().unwrap();
        assert!(inbox.attach().is_err());
        inbox.detach();
        assert!(inbox.attach().is_ok());
    }

    #[tokio::test]
    async fn test_drain_and_reject() {
        let inbox = Inbox::new("a");
        let handle = inbox.post(InboxItem::message("x"));
        for entry in inbox.drain_pending() {
            entry.reject(VisorError::AgentDead("a".into()));
        }
        assert!(inbox.is_empty());
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, VisorError::AgentDead(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_close_ends_next() {
        let inbox = Inbox::new("a");
        inbox.close();
        assert!(matches!(inbox.next().await, Err(VisorError::InboxClosed(_))));
    }

    #[test]
    fn test_steering_slot() {
        let inbox = Inbox::new("a");
        assert!(inbox.consume_steering().is_none());
        inbox.steer("first");
        inbox.steer("second");
        assert_eq!(inbox.consume_steering().as_deref(), Some("second"));
        assert!(inbox.consume_steering().is_none());
    }
}
