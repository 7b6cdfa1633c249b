//! Publish/subscribe dispatch with bounded history

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use cadre_core::{CadreError, Result};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::event::{Event, EventFilter};

const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Handler invoked synchronously for each matching event
///
/// Handlers must not block on I/O; hand work off to a channel or task
/// instead. A returned error is logged and isolated from the publisher.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct SubscriberEntry {
    token: u64,
    name: String,
    handler: EventHandler,
}

struct BusInner {
    /// Exact-type subscribers, per type, in registration order
    subscribers: HashMap<String, Vec<SubscriberEntry>>,
    /// Wildcard subscribers, dispatched for every event after the
    /// type-specific ones
    wildcard: Vec<SubscriberEntry>,
    /// Ring of recent events, oldest evicted first
    history: VecDeque<Event>,
    capacity: usize,
    next_token: u64,
}

/// Process-wide event bus
///
/// Clones share the same underlying bus, following the executor-handle
/// convention used throughout the workspace.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Capability to deregister a handler; obtained from `subscribe`
pub struct Subscription {
    inner: Arc<Mutex<BusInner>>,
    event_type: Option<String>,
    token: u64,
}

impl Subscription {
    /// Remove the handler; later publishes no longer reach it
    pub fn unsubscribe(self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        match &self.event_type {
            Some(event_type) => {
                if let Some(entries) = inner.subscribers.get_mut(event_type) {
                    entries.retain(|e| e.token != self.token);
                }
            }
            None => inner.wildcard.retain(|e| e.token != self.token),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: HashMap::new(),
                wildcard: Vec::new(),
                history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                capacity,
                next_token: 0,
            })),
        }
    }

    /// Register a handler for one event type
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        subscriber_name: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        let event_type = event_type.into();
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;

        inner
            .subscribers
            .entry(event_type.clone())
            .or_default()
            .push(SubscriberEntry {
                token,
                name: subscriber_name.into(),
                handler,
            });

        Subscription {
            inner: Arc::clone(&self.inner),
            event_type: Some(event_type),
            token,
        }
    }

    /// Register a handler for every event type
    pub fn subscribe_all(
        &self,
        subscriber_name: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;

        inner.wildcard.push(SubscriberEntry {
            token,
            name: subscriber_name.into(),
            handler,
        });

        Subscription {
            inner: Arc::clone(&self.inner),
            event_type: None,
            token,
        }
    }

    /// Publish an event: append to history, then deliver to exact-type
    /// subscribers followed by wildcard subscribers, in registration order
    ///
    /// A subscriber error is logged and never reaches the publisher or
    /// blocks delivery to subsequent subscribers. Only a missing event type
    /// is a caller error.
    pub fn publish(&self, event_type: &str, data: Map<String, Value>) -> Result<Event> {
        if event_type.is_empty() {
            return Err(CadreError::Configuration(
                "event type must not be empty".to_string(),
            ));
        }

        let event = Event::new(event_type, data);

        // History append happens under the lock so concurrent publishes
        // keep arrival order; handler dispatch happens outside it so a
        // handler may itself publish.
        let recipients: Vec<(String, EventHandler)> = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            inner.history.push_back(event.clone());
            while inner.history.len() > inner.capacity {
                inner.history.pop_front();
            }

            let mut recipients = Vec::new();
            if let Some(entries) = inner.subscribers.get(event_type) {
                for entry in entries {
                    recipients.push((entry.name.clone(), Arc::clone(&entry.handler)));
                }
            }
            for entry in &inner.wildcard {
                recipients.push((entry.name.clone(), Arc::clone(&entry.handler)));
            }
            recipients
        };

        debug!(
            "Publishing {} to {} subscriber(s)",
            event.event_type,
            recipients.len()
        );

        for (name, handler) in recipients {
            if let Err(e) = handler(&event) {
                warn!(
                    "Subscriber {} failed handling {}: {}",
                    name, event.event_type, e
                );
            }
        }

        Ok(event)
    }

    /// Read-only snapshot of retained events matching the filter
    pub fn history(&self, filter: Option<&EventFilter>) -> Vec<Event> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner
            .history
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect()
    }

    /// Number of retained events
    pub fn history_len(&self) -> usize {
        self.inner.lock().expect("bus lock poisoned").history.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
