//! Routing fabric: the authoritative map of authenticated users,
//! channels and membership.
//!
//! Per-recipient broadcast failures are logged rather than raised —
//! one disconnected peer never aborts delivery to the rest of a
//! channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use aonet_protocol::Message;

pub const GENERAL: &str = "general";

/// One registered connection's outbound handle: whatever the session
/// layer needs to push an already-encoded [`Message`] back out.
#[async_trait::async_trait]
pub trait Outbox: Send + Sync {
    async fn deliver(&self, message: Message) -> bool;
    fn close(&self);
}

struct State {
    connections: HashMap<String, Arc<dyn Outbox>>,
    channels: HashMap<String, HashSet<String>>,
    user_channels: HashMap<String, String>,
}

impl State {
    fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(GENERAL.to_string(), HashSet::new());
        Self {
            connections: HashMap::new(),
            channels,
            user_channels: HashMap::new(),
        }
    }
}

/// The shared, mutex-guarded routing table. One instance per server,
/// cloned (cheaply, via `Arc`) into every session task.
///
/// Every structural edit and every membership snapshot preceding a send
/// happens under the single internal lock; broadcasts release the lock
/// before performing network sends.
#[derive(Clone)]
pub struct Fabric {
    state: Arc<Mutex<State>>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Register `name`, evicting any prior session under the same name,
    /// and join it to `general`.
    pub async fn add_user(&self, name: &str, outbox: Arc<dyn Outbox>) {
        let mut state = self.state.lock().await;

        if let Some(old) = state.connections.get(name) {
            log::warn!("{name} already connected, kicking old session");
            old.close();
        }

        state.connections.insert(name.to_string(), outbox);
        drop(state);

        self.join_channel_inner(name, GENERAL).await;
        log::info!("{name} added to connection pool");
    }

    /// Remove `name`: leave its current channel, then drop the
    /// connection and user-channel entries. Idempotent.
    pub async fn remove_user(&self, name: &str) {
        let channel = {
            let state = self.state.lock().await;
            if !state.connections.contains_key(name) {
                return;
            }
            state.user_channels.get(name).cloned()
        };

        if let Some(channel) = channel {
            self.leave_channel(name, &channel).await;
        }

        let mut state = self.state.lock().await;
        state.connections.remove(name);
        log::info!("{name} removed from pool");
    }

    /// Move `name` into `channel`, leaving its current channel first.
    /// Creates `channel` if it does not yet exist.
    pub async fn join_channel(&self, name: &str, channel: &str) {
        self.join_channel_inner(name, channel).await;
    }

    async fn join_channel_inner(&self, name: &str, channel: &str) {
        let current = {
            let state = self.state.lock().await;
            state.user_channels.get(name).cloned()
        };
        if let Some(current) = current {
            if current != channel {
                self.leave_channel(name, &current).await;
            }
        }

        let mut state = self.state.lock().await;
        let created = !state.channels.contains_key(channel);
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(name.to_string());
        state
            .user_channels
            .insert(name.to_string(), channel.to_string());

        if created {
            log::info!("created new channel #{channel}");
        }
        log::info!("{name} joined #{channel}");
    }

    /// Discard `name` from `channel`'s member set. Deletes the channel
    /// if it is now empty and not `general`.
    pub async fn leave_channel(&self, name: &str, channel: &str) {
        let mut state = self.state.lock().await;

        if let Some(members) = state.channels.get_mut(channel) {
            members.remove(name);
            if members.is_empty() && channel != GENERAL {
                state.channels.remove(channel);
                log::info!("deleted empty channel #{channel}");
            }
        }

        state.user_channels.remove(name);
        log::info!("{name} left #{channel}");
    }

    /// Send `message` to every member of `channel` except `exclude`.
    /// No-op if the channel does not exist. Per-recipient failures are
    /// logged, never abort the broadcast.
    pub async fn broadcast(&self, channel: &str, message: Message, exclude: Option<&str>) {
        let members: Vec<(String, Arc<dyn Outbox>)> = {
            let state = self.state.lock().await;
            let Some(names) = state.channels.get(channel) else {
                log::warn!("tried to broadcast to non-existent channel #{channel}");
                return;
            };
            names
                .iter()
                .filter(|name| Some(name.as_str()) != exclude)
                .filter_map(|name| {
                    state
                        .connections
                        .get(name)
                        .map(|outbox| (name.clone(), Arc::clone(outbox)))
                })
                .collect()
        };

        let mut sent = 0usize;
        for (name, outbox) in members {
            if outbox.deliver(message.clone()).await {
                sent += 1;
            } else {
                log::warn!("failed to send to {name}");
            }
        }
        log::debug!("broadcast to #{channel}: {sent} users");
    }

    /// Send `message` to exactly `name`. Returns whether the user was
    /// known and the send succeeded.
    pub async fn direct_send(&self, name: &str, message: Message) -> bool {
        let outbox = {
            let state = self.state.lock().await;
            state.connections.get(name).cloned()
        };

        match outbox {
            Some(outbox) => outbox.deliver(message).await,
            None => {
                log::warn!("user {name} not connected");
                false
            }
        }
    }

    pub async fn channel_users(&self, channel: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_users(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.connections.keys().cloned().collect()
    }

    pub async fn user_channel(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.user_channels.get(name).cloned()
    }

    /// Number of authenticated users currently registered; the server
    /// loop compares this against `max_connections`.
    pub async fn user_count(&self) -> usize {
        let state = self.state.lock().await;
        state.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aonet_protocol::MessageType;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockOutbox {
        delivered: AtomicUsize,
        closed: AtomicBool,
        fail: bool,
    }

    impl MockOutbox {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                fail,
            })
        }
    }

    #[async_trait::async_trait]
    impl Outbox for MockOutbox {
        async fn deliver(&self, _message: Message) -> bool {
            if self.fail {
                return false;
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn text(body: &str) -> Message {
        Message::new(MessageType::Text, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn general_exists_from_birth_and_survives_emptiness() {
        let fabric = Fabric::new();
        assert_eq!(fabric.channel_users(GENERAL).await, Vec::<String>::new());

        let alice = MockOutbox::new(false);
        fabric.add_user("alice", alice).await;
        fabric.remove_user("alice").await;

        assert!(fabric.channel_users(GENERAL).await.is_empty());
        assert_eq!(fabric.user_channel("alice").await, None);
    }

    #[tokio::test]
    async fn add_user_joins_general_and_updates_invariants() {
        let fabric = Fabric::new();
        fabric.add_user("alice", MockOutbox::new(false)).await;

        assert_eq!(fabric.user_channel("alice").await.as_deref(), Some(GENERAL));
        assert!(fabric.channel_users(GENERAL).await.contains(&"alice".to_string()));
        assert!(fabric.all_users().await.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn duplicate_login_evicts_the_old_session() {
        let fabric = Fabric::new();
        let old = MockOutbox::new(false);
        fabric.add_user("alice", Arc::clone(&old) as Arc<dyn Outbox>).await;
        fabric.add_user("alice", MockOutbox::new(false)).await;

        assert!(old.closed.load(Ordering::SeqCst));
        assert_eq!(fabric.user_count().await, 1);
    }

    #[tokio::test]
    async fn join_channel_moves_user_and_creates_new_channel() {
        let fabric = Fabric::new();
        fabric.add_user("alice", MockOutbox::new(false)).await;

        fabric.join_channel("alice", "gaming").await;

        assert_eq!(fabric.user_channel("alice").await.as_deref(), Some("gaming"));
        assert!(!fabric.channel_users(GENERAL).await.contains(&"alice".to_string()));
        assert!(fabric.channel_users("gaming").await.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn leave_channel_deletes_empty_non_general_channels() {
        let fabric = Fabric::new();
        fabric.add_user("alice", MockOutbox::new(false)).await;
        fabric.join_channel("alice", "gaming").await;

        fabric.leave_channel("alice", "gaming").await;

        assert!(fabric.channel_users("gaming").await.is_empty());
        assert_eq!(fabric.user_channel("alice").await, None);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_skips_unknown_channel() {
        let fabric = Fabric::new();
        let alice = MockOutbox::new(false);
        let bob = MockOutbox::new(false);
        fabric.add_user("alice", Arc::clone(&alice) as Arc<dyn Outbox>).await;
        fabric.add_user("bob", Arc::clone(&bob) as Arc<dyn Outbox>).await;

        fabric.broadcast(GENERAL, text("hi"), Some("alice")).await;

        assert_eq!(alice.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(bob.delivered.load(Ordering::SeqCst), 1);

        fabric.broadcast("nonexistent", text("hi"), None).await;
    }

    #[tokio::test]
    async fn broadcast_swallows_per_recipient_failures() {
        let fabric = Fabric::new();
        fabric.add_user("alice", MockOutbox::new(true)).await;
        fabric.broadcast(GENERAL, text("hi"), None).await;
    }

    #[tokio::test]
    async fn direct_send_to_unknown_user_returns_false() {
        let fabric = Fabric::new();
        assert!(!fabric.direct_send("nobody", text("hi")).await);
    }

    #[tokio::test]
    async fn direct_send_to_known_user_returns_true() {
        let fabric = Fabric::new();
        fabric.add_user("alice", MockOutbox::new(false)).await;
        assert!(fabric.direct_send("alice", text("hi")).await);
    }
}
