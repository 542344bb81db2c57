//! Presence registry and per-user delivery channels.
//!
//! Each reachable user owns exactly one bounded event queue. The socket task
//! that registered it drains the queue; everything else only ever enqueues
//! with `try_send`, so a slow or dead receiver can never stall the request
//! that triggered a push.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use shared::{
    domain::{ConnectionHandle, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tracing::{debug, info, warn};

pub const DEFAULT_PUSH_BUFFER: usize = 256;

struct Registration {
    handle: ConnectionHandle,
    events: mpsc::Sender<ServerEvent>,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    connections: Arc<Mutex<HashMap<UserId, Registration>>>,
    push_buffer: usize,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_BUFFER)
    }
}

impl PresenceRegistry {
    pub fn new(push_buffer: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            push_buffer: push_buffer.max(1),
        }
    }

    /// Registers `handle` as the user's live connection and returns the
    /// receiving half of its event queue. A previous connection of the same
    /// user is superseded: its queue sender is dropped, which ends that
    /// socket's send loop.
    ///
    /// The updated reachable set is broadcast while the registry lock is
    /// held, so no client observes a snapshot older than its own connect.
    pub async fn connect(
        &self,
        user_id: UserId,
        handle: ConnectionHandle,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(self.push_buffer);
        let mut connections = self.connections.lock().await;
        if let Some(previous) = connections.insert(user_id, Registration { handle, events: tx }) {
            info!(
                user_id = user_id.0,
                superseded = %previous.handle,
                %handle,
                "presence: new connection supersedes previous one"
            );
        } else {
            info!(user_id = user_id.0, %handle, "presence: user connected");
        }
        broadcast_snapshot(&connections);
        rx
    }

    /// Removes the user's entry only if it still belongs to `handle`. A close
    /// from a superseded socket leaves the newer registration untouched.
    pub async fn disconnect(&self, user_id: UserId, handle: ConnectionHandle) -> bool {
        let mut connections = self.connections.lock().await;
        let owns_entry = connections
            .get(&user_id)
            .is_some_and(|registration| registration.handle == handle);
        if !owns_entry {
            debug!(
                user_id = user_id.0,
                %handle,
                "presence: ignoring disconnect from stale connection"
            );
            return false;
        }

        connections.remove(&user_id);
        info!(user_id = user_id.0, %handle, "presence: user disconnected");
        broadcast_snapshot(&connections);
        true
    }

    pub async fn is_reachable(&self, user_id: UserId) -> bool {
        self.connections.lock().await.contains_key(&user_id)
    }

    pub async fn reachable_users(&self) -> BTreeSet<UserId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Best-effort delivery. Returns whether the event was queued; an
    /// unreachable user or a full queue drops the event.
    pub async fn push(&self, user_id: UserId, event: ServerEvent) -> bool {
        let connections = self.connections.lock().await;
        let Some(registration) = connections.get(&user_id) else {
            debug!(
                user_id = user_id.0,
                kind = event.kind(),
                "push: user not reachable, dropping event"
            );
            return false;
        };
        enqueue(user_id, registration, event)
    }
}

fn broadcast_snapshot(connections: &HashMap<UserId, Registration>) {
    let user_ids: BTreeSet<UserId> = connections.keys().copied().collect();
    for (user_id, registration) in connections {
        enqueue(
            *user_id,
            registration,
            ServerEvent::OnlineUsers {
                user_ids: user_ids.clone(),
            },
        );
    }
}

fn enqueue(user_id: UserId, registration: &Registration, event: ServerEvent) -> bool {
    let kind = event.kind();
    match registration.events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                user_id = user_id.0,
                handle = %registration.handle,
                kind,
                "push: delivery queue full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(
                user_id = user_id.0,
                handle = %registration.handle,
                kind,
                "push: delivery channel closed, dropping event"
            );
            false
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
