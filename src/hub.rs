//! In-process fan-out of live events to every open channel of a user.
//!
//! Delivery is best-effort: each write is a single `try_send`, and a channel
//! that is full or closed is dropped from the registry on the spot. Durable
//! history lives in the notification table; this is only the live echo.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

pub const KEEPALIVE_EVENT: &str = "keepalive";

#[derive(Debug, Clone)]
pub struct HubEvent {
    pub event: String,
    pub data: Arc<str>,
}

type ChannelId = u64;

struct Inner {
    channels: DashMap<String, HashMap<ChannelId, mpsc::Sender<HubEvent>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<Inner>,
}

/// Keeps a channel registered; dropping it deregisters the channel.
pub struct Registration {
    hub: NotificationHub,
    user_id: String,
    id: ChannelId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.hub.deregister(&self.user_id, self.id) {
            debug!(user_id = %self.user_id, channel = self.id, "push channel closed");
        }
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Opens a fresh bounded channel for `user_id` and registers its sending half.
    pub fn connect(&self, user_id: &str) -> (Registration, mpsc::Receiver<HubEvent>) {
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        (self.register(user_id, sender), receiver)
    }

    pub fn register(&self, user_id: &str, sender: mpsc::Sender<HubEvent>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            hub: self.clone(),
            user_id: user_id.to_string(),
            id,
        };
        if self.inner.closed.load(Ordering::Acquire) {
            // Dropping the sender ends the consumer's stream immediately.
            return registration;
        }
        self.inner
            .channels
            .entry(user_id.to_string())
            .or_default()
            .insert(id, sender);
        // A shutdown that cleared the map before this insert must not leave it behind.
        if self.inner.closed.load(Ordering::Acquire) {
            self.deregister(user_id, id);
            return registration;
        }
        debug!(user_id, channel = id, "push channel registered");
        registration
    }

    pub fn push<T: Serialize>(&self, user_id: &str, event: &str, payload: &T) {
        let Some(event) = encode(event, payload) else {
            return;
        };
        let emptied = match self.inner.channels.get_mut(user_id) {
            Some(mut channels) => {
                channels.retain(|id, sender| deliver(sender, &event, user_id, *id));
                channels.is_empty()
            }
            None => return,
        };
        if emptied {
            self.inner
                .channels
                .remove_if(user_id, |_, channels| channels.is_empty());
        }
    }

    /// Writes to every registered channel of every user.
    pub fn broadcast_all<T: Serialize>(&self, event: &str, payload: &T) {
        let Some(event) = encode(event, payload) else {
            return;
        };
        self.fan_out(&event);
    }

    /// One keepalive round across all channels.
    pub fn keepalive(&self) {
        self.broadcast_all(KEEPALIVE_EVENT, &json!({ "ts": Utc::now() }));
    }

    pub fn spawn_keepalive(&self, every: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => hub.keepalive(),
                    _ = shutdown.wait_for(|closed| *closed) => break,
                }
            }
            debug!("keepalive loop stopped");
        })
    }

    /// Closes every channel and refuses new registrations.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        let users = self.inner.channels.len();
        self.inner.channels.clear();
        info!(users, "notification hub shut down");
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.inner
            .channels
            .get(user_id)
            .map(|channels| channels.len())
            .unwrap_or(0)
    }

    pub fn user_count(&self) -> usize {
        self.inner.channels.len()
    }

    fn fan_out(&self, event: &HubEvent) {
        for mut entry in self.inner.channels.iter_mut() {
            let (user_id, channels) = entry.pair_mut();
            channels.retain(|id, sender| deliver(sender, event, user_id, *id));
        }
        self.inner.channels.retain(|_, channels| !channels.is_empty());
    }

    fn deregister(&self, user_id: &str, id: ChannelId) -> bool {
        let removed = match self.inner.channels.get_mut(user_id) {
            Some(mut channels) => channels.remove(&id).is_some(),
            None => false,
        };
        if removed {
            self.inner
                .channels
                .remove_if(user_id, |_, channels| channels.is_empty());
        }
        removed
    }
}

/// SSE event names are a single line.
pub fn valid_event_name(event: &str) -> bool {
    !event.is_empty() && !event.contains(['\r', '\n'])
}

fn encode<T: Serialize>(event: &str, payload: &T) -> Option<HubEvent> {
    if !valid_event_name(event) {
        error!(event, "refusing push with an invalid event name");
        return None;
    }
    match serde_json::to_string(payload) {
        Ok(data) => Some(HubEvent {
            event: event.to_string(),
            data: Arc::from(data),
        }),
        Err(err) => {
            error!(event, "failed to encode push payload: {err}");
            None
        }
    }
}

fn deliver(sender: &mpsc::Sender<HubEvent>, event: &HubEvent, user_id: &str, id: ChannelId) -> bool {
    match sender.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(user_id, channel = id, event = %event.event, "push channel backed up, pruning");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(user_id, channel = id, event = %event.event, "push channel gone, pruning");
            false
        }
    }
}
