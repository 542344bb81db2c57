//! Client-side view of conversations, the open thread and presence.
//!
//! Everything here is rebuilt from REST on each (re)connect; pushes are
//! folded in on top and deduplicated so a push that races a resync is never
//! counted twice.

use std::collections::{BTreeSet, HashSet};

use shared::{
    domain::{MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, MessageReadPayload, ReadReceipt, ServerEvent},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub counterpart: UserId,
    /// Ascending by `created_at`.
    pub messages: Vec<MessagePayload>,
}

impl Thread {
    fn contains(&self, message_id: MessageId) -> bool {
        self.messages.iter().any(|m| m.message_id == message_id)
    }
}

/// What applying one push changed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The message was new. `mark_read` is set when it landed in the open
    /// thread as an unread incoming message.
    Message {
        message: MessagePayload,
        mark_read: Option<MessageId>,
    },
    Receipt(MessageReadPayload),
    Presence(BTreeSet<UserId>),
    ServerError(String),
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub user_id: UserId,
    pub conversations: Vec<ConversationSummary>,
    pub open_thread: Option<Thread>,
    pub online: BTreeSet<UserId>,
    // Own receipts already taken off an unread count.
    counted_reads: HashSet<MessageId>,
}

impl LocalState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            conversations: Vec::new(),
            open_thread: None,
            online: BTreeSet::new(),
            counted_reads: HashSet::new(),
        }
    }

    pub fn replace_conversations(&mut self, mut conversations: Vec<ConversationSummary>) {
        sort_conversations(&mut conversations);
        self.conversations = conversations;
    }

    pub fn replace_thread(&mut self, counterpart: UserId, mut messages: Vec<MessagePayload>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.open_thread = Some(Thread {
            counterpart,
            messages,
        });
    }

    pub fn close_thread(&mut self) {
        self.open_thread = None;
    }

    pub fn open_counterpart(&self) -> Option<UserId> {
        self.open_thread.as_ref().map(|t| t.counterpart)
    }

    pub fn unread_in_open_thread(&self) -> Vec<MessageId> {
        let Some(thread) = &self.open_thread else {
            return Vec::new();
        };
        thread
            .messages
            .iter()
            .filter(|m| m.receiver_id() == self.user_id && !m.is_read_by(self.user_id))
            .map(|m| m.message_id)
            .collect()
    }

    pub fn unread_total(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn apply(&mut self, event: ServerEvent) -> Applied {
        match event {
            ServerEvent::NewMessage { message } => self.apply_message(message),
            ServerEvent::MessageRead(read) => {
                if self.apply_receipt(&read) {
                    Applied::Receipt(read)
                } else {
                    Applied::Duplicate
                }
            }
            ServerEvent::OnlineUsers { user_ids } => {
                self.online = user_ids.clone();
                Applied::Presence(user_ids)
            }
            ServerEvent::Error(error) => Applied::ServerError(error.to_string()),
        }
    }

    /// Folds in a message this client just sent. The server does not push a
    /// sender its own messages.
    pub fn record_sent(&mut self, message: MessagePayload) -> bool {
        !matches!(self.apply_message(message), Applied::Duplicate)
    }

    /// Records the local user's own receipt after a successful mark-read and
    /// takes it off the unread count of the conversation with `counterpart`,
    /// whichever thread is open by now. A message no longer held locally
    /// still counts once; one whose receipt was already known does not.
    pub fn record_own_read(
        &mut self,
        counterpart: UserId,
        message_id: MessageId,
        receipt: ReadReceipt,
    ) {
        let read = MessageReadPayload {
            message_id,
            reader_id: receipt.reader_id,
            read_at: receipt.read_at,
        };
        let held = self.holds(message_id);
        let changed = self.apply_receipt(&read);
        if (changed || !held) && self.counted_reads.insert(message_id) {
            if let Some(conversation) = self.conversation_mut(counterpart) {
                conversation.unread_count = conversation.unread_count.saturating_sub(1);
            }
        }
    }

    pub fn remove_message(&mut self, message_id: MessageId) -> bool {
        let Some(thread) = &mut self.open_thread else {
            return false;
        };
        let before = thread.messages.len();
        thread.messages.retain(|m| m.message_id != message_id);
        thread.messages.len() != before
    }

    fn apply_message(&mut self, message: MessagePayload) -> Applied {
        let me = self.user_id;
        let Some(counterpart) = message.counterpart_of(me) else {
            return Applied::Duplicate;
        };
        let incoming = message.receiver_id() == me && !message.is_read_by(me);

        let mut inserted_in_thread = false;
        if let Some(thread) = self
            .open_thread
            .as_mut()
            .filter(|t| t.counterpart == counterpart)
        {
            if !thread.contains(message.message_id) {
                let at = thread
                    .messages
                    .partition_point(|m| m.created_at <= message.created_at);
                thread.messages.insert(at, message.clone());
                inserted_in_thread = true;
            }
        }
        let auto_read = inserted_in_thread && incoming;

        let conversation_changed = match self.conversation_mut(counterpart) {
            Some(conversation) => {
                // Anything not newer than the current head was already part
                // of the last resync.
                if message.created_at > conversation.last_message.created_at {
                    conversation.last_message = message.clone();
                    if incoming {
                        conversation.unread_count += 1;
                    }
                    true
                } else {
                    false
                }
            }
            None => {
                let counterpart_summary = if message.sender_id() == me {
                    message.receiver.clone()
                } else {
                    message.sender.clone()
                };
                self.conversations.push(ConversationSummary {
                    counterpart: counterpart_summary,
                    last_message: message.clone(),
                    unread_count: u32::from(incoming),
                });
                true
            }
        };
        sort_conversations(&mut self.conversations);

        if !inserted_in_thread && !conversation_changed {
            return Applied::Duplicate;
        }
        Applied::Message {
            mark_read: auto_read.then_some(message.message_id),
            message,
        }
    }

    fn apply_receipt(&mut self, read: &MessageReadPayload) -> bool {
        let receipt = read.receipt();
        let mut changed = false;
        if let Some(thread) = &mut self.open_thread {
            if let Some(message) = thread
                .messages
                .iter_mut()
                .find(|m| m.message_id == read.message_id)
            {
                changed |= message.record_read(receipt);
            }
        }
        for conversation in &mut self.conversations {
            if conversation.last_message.message_id == read.message_id {
                changed |= conversation.last_message.record_read(receipt);
            }
        }
        changed
    }

    fn holds(&self, message_id: MessageId) -> bool {
        self.open_thread
            .as_ref()
            .is_some_and(|t| t.contains(message_id))
            || self
                .conversations
                .iter()
                .any(|c| c.last_message.message_id == message_id)
    }

    fn conversation_mut(&mut self, counterpart: UserId) -> Option<&mut ConversationSummary> {
        self.conversations
            .iter_mut()
            .find(|c| c.counterpart.user_id == counterpart)
    }
}

fn sort_conversations(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| b.updated_at().cmp(&a.updated_at()));
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
