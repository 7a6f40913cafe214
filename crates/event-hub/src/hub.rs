use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::ExecutionEvent;

pub type ChannelId = u64;

/// Per-channel queue depth. A channel that falls this far behind is dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// What a channel's writer should put on the wire next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-serialized JSON frame, shared by every recipient of a publish.
    Text(Arc<str>),
    Ping,
    Close,
}

struct Channel {
    tx: mpsc::Sender<Outbound>,
    last_seen: Instant,
    topics: HashSet<String>,
}

#[derive(Default)]
struct State {
    channels: HashMap<ChannelId, Channel>,
    topics: HashMap<String, HashSet<ChannelId>>,
}

impl State {
    /// Remove a channel from every topic it belongs to, pruning empty topics.
    /// Dropping the sender ends the channel's writer.
    fn drop_channel(&mut self, id: ChannelId) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };
        for topic in &channel.topics {
            self.leave(topic, id);
        }
        true
    }

    fn leave(&mut self, topic: &str, id: ChannelId) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

pub struct Hub {
    state: Mutex<State>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a new channel. The receiver yields everything addressed to it
    /// and ends when the hub drops the channel.
    pub fn register(&self) -> (ChannelId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.state.lock().channels.insert(
            id,
            Channel {
                tx,
                last_seen: Instant::now(),
                topics: HashSet::new(),
            },
        );
        debug!(channel = id, "channel registered");
        (id, rx)
    }

    /// Subscribe `channel` to `execution_id`, creating the topic if needed.
    /// Returns `false` for an unknown channel.
    pub fn subscribe(&self, channel: ChannelId, execution_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(&channel) else {
            return false;
        };
        entry.topics.insert(execution_id.to_string());
        state
            .topics
            .entry(execution_id.to_string())
            .or_default()
            .insert(channel);
        true
    }

    pub fn unsubscribe(&self, channel: ChannelId, execution_id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .channels
            .get_mut(&channel)
            .is_some_and(|entry| entry.topics.remove(execution_id));
        state.leave(execution_id, channel);
        removed
    }

    pub fn is_subscribed(&self, channel: ChannelId, execution_id: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(&channel)
            .is_some_and(|entry| entry.topics.contains(execution_id))
    }

    /// Forget a channel entirely (connection closed).
    pub fn disconnect(&self, channel: ChannelId) {
        if self.state.lock().drop_channel(channel) {
            debug!(channel, "channel disconnected");
        }
    }

    /// Record activity from the peer; resets its heartbeat clock.
    pub fn touch(&self, channel: ChannelId) {
        if let Some(entry) = self.state.lock().channels.get_mut(&channel) {
            entry.last_seen = Instant::now();
        }
    }

    /// Deliver an event to every subscriber of its execution id.
    ///
    /// Subscribers whose queue is closed or full are dropped; the rest still
    /// receive the event. Returns the number of channels reached.
    pub fn publish(&self, execution_id: &str, event: &ExecutionEvent) -> usize {
        let Some(frame) = serialize(event) else {
            return 0;
        };
        let mut state = self.state.lock();
        let Some(subscribers) = state.topics.get(execution_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in subscribers {
            match state.channels.get(id) {
                Some(channel) => match channel.tx.try_send(Outbound::Text(Arc::clone(&frame))) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((*id, reason(&e))),
                },
                None => failed.push((*id, "unknown")),
            }
        }
        for (id, why) in failed {
            debug!(channel = id, execution_id, reason = why, "dropping subscriber");
            if !state.drop_channel(id) {
                state.leave(execution_id, id);
            }
        }
        delivered
    }

    /// Deliver an event to every connected channel regardless of topic.
    pub fn broadcast(&self, event: &ExecutionEvent) -> usize {
        let Some(frame) = serialize(event) else {
            return 0;
        };
        self.send_all(|| Outbound::Text(Arc::clone(&frame)))
    }

    /// Queue a frame for one channel (control replies). Drops the channel
    /// if it cannot take it.
    pub fn send_to(&self, channel: ChannelId, frame: Arc<str>) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get(&channel) else {
            return false;
        };
        if entry.tx.try_send(Outbound::Text(frame)).is_ok() {
            return true;
        }
        state.drop_channel(channel);
        false
    }

    /// Ping every channel and prune those silent for longer than `stale_after`.
    /// Returns the pruned channel ids.
    pub fn heartbeat(&self, stale_after: Duration) -> Vec<ChannelId> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut pruned = Vec::new();
        for (id, channel) in &state.channels {
            let stale = now.saturating_duration_since(channel.last_seen) > stale_after;
            if stale || channel.tx.try_send(Outbound::Ping).is_err() {
                pruned.push(*id);
            }
        }
        for id in &pruned {
            state.drop_channel(*id);
        }
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned stale channels");
        }
        pruned
    }

    /// Ask every channel to close and forget all of them.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        for channel in state.channels.values() {
            let _ = channel.tx.try_send(Outbound::Close);
        }
        state.channels.clear();
        state.topics.clear();
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(execution_id)
            .map_or(0, HashSet::len)
    }

    fn send_all(&self, make: impl Fn() -> Outbound) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, channel) in &state.channels {
            if channel.tx.try_send(make()).is_ok() {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }
        for id in failed {
            state.drop_channel(id);
        }
        delivered
    }
}

fn serialize(event: &ExecutionEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(execution_id = %event.execution_id, error = %e, "event serialization failed");
            None
        }
    }
}

fn reason(err: &TrySendError<Outbound>) -> &'static str {
    match err {
        TrySendError::Full(_) => "full",
        TrySendError::Closed(_) => "closed",
    }
}
