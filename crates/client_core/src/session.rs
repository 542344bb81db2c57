//! Client session controller.
//!
//! Owns one user's push channel: connects it, resyncs REST state on every
//! (re)connect, applies pushes to [`LocalState`] and reconnects with
//! exponential backoff until the user logs out.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::{MessageId, UserId},
    protocol::{MessagePayload, MessageReadPayload, Pagination, ReadReceipt, DEFAULT_PAGE_LIMIT},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    backend::MessagingBackend,
    backoff::ReconnectPolicy,
    error::{ClientError, Result},
    push::{PushConnector, PushFrame, PushStream},
    state::{Applied, LocalState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// REST state was re-fetched after a connect.
    Resynced { conversations: usize },
    MessageReceived(MessagePayload),
    MessageRead(MessageReadPayload),
    PresenceChanged(BTreeSet<UserId>),
    Error(String),
}

struct Shared {
    user_id: UserId,
    backend: Arc<dyn MessagingBackend>,
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    local: Mutex<LocalState>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

pub struct SessionController {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Starts the session for an already authenticated user. Connecting
    /// begins immediately in the background.
    pub fn start(
        user_id: UserId,
        backend: Arc<dyn MessagingBackend>,
        connector: Arc<dyn PushConnector>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(1024);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            user_id,
            backend,
            connector,
            policy,
            local: Mutex::new(LocalState::new(user_id)),
            state,
            events,
        });

        let task = tokio::spawn(run(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Logs in by username, then starts the session for the returned id.
    pub async fn login(
        username: &str,
        backend: Arc<dyn MessagingBackend>,
        connector: Arc<dyn PushConnector>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let user_id = backend.login(username).await?;
        info!(user_id = user_id.0, "session: logged in");
        Ok(Self::start(user_id, backend, connector, policy))
    }

    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Session events as a stream; lagged receivers skip what they missed.
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: event stream lagged");
                        None
                    }
                }
            })
            .boxed()
    }

    pub async fn snapshot(&self) -> LocalState {
        self.shared.local.lock().await.clone()
    }

    /// Fetches the newest page of the thread with `counterpart`, makes it the
    /// open thread and marks every unread incoming message in it read.
    pub async fn open_thread(&self, counterpart: UserId) -> Result<Vec<MessagePayload>> {
        self.ensure_active()?;
        let page = self
            .shared
            .backend
            .thread(
                self.shared.user_id,
                counterpart,
                Pagination::first(DEFAULT_PAGE_LIMIT),
            )
            .await?;

        let unread = {
            let mut local = self.shared.local.lock().await;
            local.replace_thread(counterpart, page.messages);
            local.unread_in_open_thread()
        };
        for message_id in unread {
            self.shared.mark_read(counterpart, message_id).await;
        }

        let local = self.shared.local.lock().await;
        Ok(local
            .open_thread
            .as_ref()
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    pub async fn close_thread(&self) {
        self.shared.local.lock().await.close_thread();
    }

    /// Sends a message. On failure nothing is added locally; on success the
    /// stored message is folded into local state.
    pub async fn send(&self, receiver_id: UserId, content: &str) -> Result<MessagePayload> {
        self.ensure_active()?;
        let message = self
            .shared
            .backend
            .send(self.shared.user_id, receiver_id, content)
            .await?;
        self.shared
            .local
            .lock()
            .await
            .record_sent(message.clone());
        Ok(message)
    }

    pub async fn delete(&self, message_id: MessageId) -> Result<()> {
        self.ensure_active()?;
        self.shared
            .backend
            .delete(self.shared.user_id, message_id)
            .await?;
        self.shared.local.lock().await.remove_message(message_id);
        self.shared.refresh_conversations().await?;
        Ok(())
    }

    /// Ends the session: stops reconnecting, closes the channel and leaves
    /// the controller `Disconnected` for good.
    pub async fn logout(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "session: run loop ended abnormally");
            }
        }
        self.shared.set_state(SessionState::Disconnected);
        *self.shared.local.lock().await = LocalState::new(self.shared.user_id);
        info!(user_id = self.shared.user_id.0, "session: logged out");
    }

    fn ensure_active(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(ClientError::NotLoggedIn);
        }
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!(user_id = self.user_id.0, state = %next, "session: state changed");
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn refresh_conversations(&self) -> Result<usize> {
        let conversations = self.backend.conversations(self.user_id).await?;
        let count = conversations.len();
        self.local.lock().await.replace_conversations(conversations);
        Ok(count)
    }

    /// Re-fetches everything pushes may have changed while the channel was
    /// down: the conversation list and the open thread.
    async fn resync(&self) -> Result<()> {
        let conversations = self.refresh_conversations().await?;

        let open = self.local.lock().await.open_counterpart();
        if let Some(counterpart) = open {
            let page = self
                .backend
                .thread(self.user_id, counterpart, Pagination::first(DEFAULT_PAGE_LIMIT))
                .await?;
            let unread = {
                let mut local = self.local.lock().await;
                // Skip if the user switched threads meanwhile.
                if local.open_counterpart() == Some(counterpart) {
                    local.replace_thread(counterpart, page.messages);
                    local.unread_in_open_thread()
                } else {
                    Vec::new()
                }
            };
            for message_id in unread {
                self.mark_read(counterpart, message_id).await;
            }
        }

        match self.backend.online_users().await {
            Ok(online) => self.local.lock().await.online = online,
            Err(error) => debug!(%error, "session: presence lookup failed"),
        }

        info!(user_id = self.user_id.0, conversations, "session: resynced");
        self.emit(SessionEvent::Resynced { conversations });
        Ok(())
    }

    /// Marks one message read. A failure is reported but leaves the message
    /// unread locally, so the next resync retries it.
    async fn mark_read(&self, counterpart: UserId, message_id: MessageId) {
        match self.backend.mark_read(self.user_id, message_id).await {
            Ok(()) => {
                let receipt = ReadReceipt {
                    reader_id: self.user_id,
                    read_at: Utc::now(),
                };
                self.local
                    .lock()
                    .await
                    .record_own_read(counterpart, message_id, receipt);
            }
            Err(error) => {
                warn!(message_id = message_id.0, %error, "session: mark read failed");
                self.emit(SessionEvent::Error(error.to_string()));
            }
        }
    }

    async fn connect(&self) -> Result<PushStream> {
        let stream = self.connector.connect(self.user_id).await?;
        self.set_state(SessionState::Connected);
        // Pushes arriving during the resync wait in the stream and are
        // deduplicated against the fresh state when applied.
        self.resync().await?;
        Ok(stream)
    }

    /// Applies pushes until the channel fails. A channel that stays silent
    /// for `idle_timeout`, heartbeats included, counts as lost: a peer that
    /// vanished without closing the socket never ends the stream.
    async fn pump(&self, mut stream: PushStream) -> ClientError {
        let idle_timeout = self.policy.idle_timeout;
        loop {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(PushFrame::Event(event)))) => self.handle_push(event).await,
                Ok(Some(Ok(PushFrame::Heartbeat))) => {}
                Ok(Some(Err(error))) => return error,
                Ok(None) => return ClientError::ConnectionLost,
                Err(_) => {
                    warn!(
                        user_id = self.user_id.0,
                        idle_ms = idle_timeout.as_millis() as u64,
                        "session: push channel silent"
                    );
                    return ClientError::ConnectionLost;
                }
            }
        }
    }

    async fn handle_push(&self, event: shared::protocol::ServerEvent) {
        let kind = event.kind();
        let applied = self.local.lock().await.apply(event);
        match applied {
            Applied::Message { message, mark_read } => {
                let counterpart = message.counterpart_of(self.user_id);
                self.emit(SessionEvent::MessageReceived(message));
                if let (Some(message_id), Some(counterpart)) = (mark_read, counterpart) {
                    self.mark_read(counterpart, message_id).await;
                }
            }
            Applied::Receipt(read) => self.emit(SessionEvent::MessageRead(read)),
            Applied::Presence(online) => self.emit(SessionEvent::PresenceChanged(online)),
            Applied::ServerError(error) => {
                warn!(%error, "session: server reported an error");
                self.emit(SessionEvent::Error(error));
            }
            Applied::Duplicate => debug!(kind, "session: duplicate push ignored"),
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(SessionState::Connecting);

        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = shared.connect() => result,
        };

        match connected {
            Ok(stream) => {
                attempt = 0;
                let lost = tokio::select! {
                    _ = shutdown.changed() => break,
                    lost = shared.pump(stream) => lost,
                };
                warn!(user_id = shared.user_id.0, error = %lost, "session: push channel lost");
                shared.emit(SessionEvent::Error(lost.to_string()));
            }
            Err(error) => {
                warn!(user_id = shared.user_id.0, %error, attempt, "session: connect failed");
                shared.emit(SessionEvent::Error(error.to_string()));
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.policy.delay_for(attempt);
        shared.set_state(SessionState::Reconnecting { attempt, delay });
        info!(
            user_id = shared.user_id.0,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "session: reconnecting"
        );

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(SessionState::Disconnected);
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
