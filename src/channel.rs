use crate::handler::Callback;
use crate::message::{ChangePayload, EventType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Operations a channel asks of the client that owns it.
///
/// Implemented by the client; channels never touch the transport directly.
pub(crate) trait ChannelOwner: Send + Sync {
    fn subscribe_channel(&self, channel: &Arc<ChannelShared>);
    fn unsubscribe_channel(&self, channel: &Arc<ChannelShared>);
}

/// State shared by every handle to one channel
pub(crate) struct ChannelShared {
    name: String,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    subscribed: bool,
    handlers: HashMap<EventType, HashSet<Callback>>,
}

impl ChannelShared {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ChannelState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    /// Set the subscribed flag. Returns false if it was already set.
    pub fn mark_subscribed(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.subscribed, true)
    }

    /// Clear the subscribed flag and every handler. Returns false if the
    /// channel was not subscribed, in which case nothing changes.
    pub fn mark_unsubscribed(&self) -> bool {
        let mut state = self.state.lock();
        if !state.subscribed {
            return false;
        }
        state.subscribed = false;
        state.handlers.clear();
        true
    }

    /// Drop all state regardless of the subscribed flag
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.subscribed = false;
        state.handlers.clear();
    }

    fn add_handler(&self, event: EventType, callback: Callback) {
        self.state
            .lock()
            .handlers
            .entry(event)
            .or_default()
            .insert(callback);
    }

    fn remove_handler(&self, event: EventType, callback: Option<&Callback>) {
        let mut state = self.state.lock();
        match callback {
            None => {
                state.handlers.remove(&event);
            }
            Some(callback) => {
                if let Some(set) = state.handlers.get_mut(&event) {
                    set.remove(callback);
                    if set.is_empty() {
                        state.handlers.remove(&event);
                    }
                }
            }
        }
    }

    /// Deliver a payload to its typed handlers, then to wildcard handlers.
    ///
    /// Handlers run outside the channel lock so they may call back into the
    /// channel. Returns how many invocations failed.
    pub fn dispatch(&self, payload: &ChangePayload) -> usize {
        let (typed, wildcard) = {
            let state = self.state.lock();
            let snapshot = |event: EventType| -> Vec<Callback> {
                state
                    .handlers
                    .get(&event)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default()
            };
            let typed = if payload.event_type == EventType::All {
                Vec::new()
            } else {
                snapshot(payload.event_type)
            };
            (typed, snapshot(EventType::All))
        };

        trace!(
            "[CHANNEL-{}] Dispatching {} to {} typed and {} wildcard handlers",
            self.name,
            payload.event_type,
            typed.len(),
            wildcard.len()
        );

        let mut failures = 0;
        let batches = [(payload.event_type, typed), (EventType::All, wildcard)];
        for (event, callbacks) in batches {
            for callback in callbacks {
                if let Err(failure) = callback.invoke(event, payload) {
                    failures += 1;
                    warn!(
                        "[CHANNEL-{}] Handler for {} {}",
                        self.name, event, failure
                    );
                }
            }
        }
        failures
    }

    #[cfg(test)]
    fn handler_count(&self, event: EventType) -> usize {
        self.state
            .lock()
            .handlers
            .get(&event)
            .map_or(0, HashSet::len)
    }
}

/// A named logical subscription on the shared connection.
///
/// Obtained from [`RealtimeClient::channel`](crate::RealtimeClient::channel);
/// handles are cheap to clone and every handle for a name refers to the same
/// channel until it is unsubscribed.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    owner: Weak<dyn ChannelOwner>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, owner: Weak<dyn ChannelOwner>) -> Self {
        Self { shared, owner }
    }

    /// Channel name, unique within the client
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// True between `subscribe()` and `unsubscribe()`, whatever the
    /// transport is doing
    pub fn is_subscribed(&self) -> bool {
        self.shared.is_subscribed()
    }

    /// Register a handler for an event type. `EventType::All` receives every
    /// payload. Registering the same callback twice under one type is a no-op.
    pub fn on(&self, event: EventType, callback: Callback) -> &Self {
        self.shared.add_handler(event, callback);
        self
    }

    /// Remove one handler, or every handler for the type when `callback` is
    /// `None`. Removing an unknown handler is a no-op.
    pub fn off(&self, event: EventType, callback: Option<&Callback>) -> &Self {
        self.shared.remove_handler(event, callback);
        self
    }

    /// Start receiving events. Opens the shared connection if needed.
    /// Calling it on a subscribed channel does nothing.
    pub fn subscribe(&self) -> &Self {
        match self.owner.upgrade() {
            Some(owner) => owner.subscribe_channel(&self.shared),
            None => debug!(
                "[CHANNEL-{}] Client dropped, ignoring subscribe",
                self.shared.name()
            ),
        }
        self
    }

    /// Stop receiving events, drop every handler and release the name.
    /// Calling it on an unsubscribed channel does nothing.
    pub fn unsubscribe(&self) {
        match self.owner.upgrade() {
            Some(owner) => owner.unsubscribe_channel(&self.shared),
            None => self.shared.reset(),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name())
            .field("subscribed", &self.shared.is_subscribed())
            .finish()
    }
}
