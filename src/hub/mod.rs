//! Topic-namespaced event broadcast.
//!
//! The hub holds one bounded frame buffer per connected listener. Publishing
//! never waits on a listener: when a buffer is full the oldest frame is
//! dropped and a warning names the listener, so one stalled socket cannot
//! slow the rest. Listeners default to every topic and narrow or widen the
//! set with subscribe/unsubscribe commands; hydration frames are delivered
//! directly to one listener and bypass topic filtering.

pub mod server;

pub use server::{AppState, SharedState, build_router, serve};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::events::{EngineEvent, Topic};

pub const DEFAULT_LISTENER_BUFFER: usize = 256;

struct Listener {
    topics: HashSet<Topic>,
    buffer: VecDeque<Value>,
    notify: Arc<Notify>,
    dropped: u64,
}

struct HubInner {
    next_id: u64,
    capacity: usize,
    listeners: HashMap<u64, Listener>,
}

/// Cloneable handle on the shared listener registry.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_LISTENER_BUFFER)
    }

    /// A hub whose listeners each buffer at most `capacity` frames.
    pub fn with_buffer(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_id: 1,
                capacity: capacity.max(1),
                listeners: HashMap::new(),
            })),
        }
    }

    /// Attach a listener subscribed to every topic. Detaches on drop.
    pub fn register(&self) -> ListenerHandle {
        let notify = Arc::new(Notify::new());
        let mut handle = ListenerHandle {
            id: 0,
            hub: self.clone(),
            notify: notify.clone(),
        };
        let Ok(mut inner) = self.inner.lock() else {
            warn!("listener registry poisoned; new listener will see no events");
            return handle;
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Listener {
                topics: Topic::ALL.into_iter().collect(),
                buffer: VecDeque::new(),
                notify,
                dropped: 0,
            },
        );
        debug!(listener = id, "listener attached");
        handle.id = id;
        handle
    }

    /// Broadcast one event to every listener subscribed to its topic.
    pub fn publish(&self, event: EngineEvent) {
        let topic = event.topic();
        let frame = event.frame();
        let Ok(mut inner) = self.inner.lock() else {
            warn!("listener registry poisoned; dropping event");
            return;
        };
        let capacity = inner.capacity;
        for (id, listener) in inner.listeners.iter_mut() {
            if !listener.topics.contains(&topic) {
                continue;
            }
            push_bounded(*id, listener, frame.clone(), capacity);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.listeners.len())
            .unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

fn push_bounded(id: u64, listener: &mut Listener, frame: Value, capacity: usize) {
    if listener.buffer.len() >= capacity {
        listener.buffer.pop_front();
        listener.dropped += 1;
        warn!(
            listener = id,
            dropped_total = listener.dropped,
            "listener buffer full, dropping oldest frame"
        );
    }
    listener.buffer.push_back(frame);
    listener.notify.notify_one();
}

/// One listener's view of the hub: pop frames, adjust topics.
pub struct ListenerHandle {
    id: u64,
    hub: EventHub,
    notify: Arc<Notify>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a frame to this listener only, regardless of its topic set.
    pub fn send(&self, frame: Value) {
        let Ok(mut inner) = self.hub.inner.lock() else {
            warn!(listener = self.id, "listener registry poisoned; dropping frame");
            return;
        };
        let capacity = inner.capacity;
        if let Some(listener) = inner.listeners.get_mut(&self.id) {
            push_bounded(self.id, listener, frame, capacity);
        }
    }

    /// Add topics to the subscription set.
    pub fn subscribe(&self, topics: &[Topic]) {
        self.with_topics(|set| set.extend(topics.iter().copied()));
    }

    /// Remove topics from the subscription set.
    pub fn unsubscribe(&self, topics: &[Topic]) {
        self.with_topics(|set| {
            for topic in topics {
                set.remove(topic);
            }
        });
    }

    fn with_topics(&self, adjust: impl FnOnce(&mut HashSet<Topic>)) {
        let Ok(mut inner) = self.hub.inner.lock() else {
            warn!(listener = self.id, "listener registry poisoned");
            return;
        };
        if let Some(listener) = inner.listeners.get_mut(&self.id) {
            adjust(&mut listener.topics);
        }
    }

    /// Pop the next buffered frame without waiting.
    pub fn try_next(&self) -> Option<Value> {
        let Ok(mut inner) = self.hub.inner.lock() else {
            return None;
        };
        inner.listeners.get_mut(&self.id)?.buffer.pop_front()
    }

    /// Wait for the next frame. `None` only if the listener was detached.
    pub async fn next(&self) -> Option<Value> {
        loop {
            {
                let Ok(mut inner) = self.hub.inner.lock() else {
                    return None;
                };
                let listener = inner.listeners.get_mut(&self.id)?;
                if let Some(frame) = listener.buffer.pop_front() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Ok(mut inner) = self.hub.inner.lock() else {
            return;
        };
        inner.listeners.remove(&self.id);
        debug!(listener = self.id, "listener detached");
    }
}
