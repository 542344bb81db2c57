use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, UserId},
    error::ApiError,
};

pub const MAX_CONTENT_CHARS: usize = 1000;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender: UserSummary,
    pub receiver: UserSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
}

impl MessagePayload {
    pub fn sender_id(&self) -> UserId {
        self.sender.user_id
    }

    pub fn receiver_id(&self) -> UserId {
        self.receiver.user_id
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|r| r.reader_id == user_id)
    }

    /// Read status from the sender's point of view.
    pub fn is_seen_by_receiver(&self) -> bool {
        self.is_read_by(self.receiver_id())
    }

    pub fn counterpart_of(&self, user_id: UserId) -> Option<UserId> {
        if self.sender_id() == user_id {
            Some(self.receiver_id())
        } else if self.receiver_id() == user_id {
            Some(self.sender_id())
        } else {
            None
        }
    }

    /// Appends a receipt unless the reader is already recorded. Returns
    /// whether anything changed.
    pub fn record_read(&mut self, receipt: ReadReceipt) -> bool {
        if self.is_read_by(receipt.reader_id) {
            return false;
        }
        self.read_by.push(receipt);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub counterpart: UserSummary,
    pub last_message: MessagePayload,
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.last_message.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

impl PageInfo {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let pages = total.div_ceil(u64::from(limit.max(1)));
        Self {
            page,
            limit,
            total,
            pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub pagination: PageInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Pagination {
    pub fn first(limit: u32) -> Self {
        Self {
            page: Some(1),
            limit: Some(limit),
        }
    }

    /// Page number and limit with defaults applied and the limit clamped.
    pub fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        (page, limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReadPayload {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

impl MessageReadPayload {
    pub fn receipt(&self) -> ReadReceipt {
        ReadReceipt {
            reader_id: self.reader_id,
            read_at: self.read_at,
        }
    }
}

/// Events pushed from the server over a user's delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "newMessage")]
    NewMessage { message: MessagePayload },
    /// Always the full reachable set, never a diff.
    #[serde(rename = "getOnlineUsers")]
    OnlineUsers { user_ids: BTreeSet<UserId> },
    #[serde(rename = "messageRead")]
    MessageRead(MessageReadPayload),
    #[serde(rename = "error")]
    Error(ApiError),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "newMessage",
            ServerEvent::OnlineUsers { .. } => "getOnlineUsers",
            ServerEvent::MessageRead(_) => "messageRead",
            ServerEvent::Error(_) => "error",
        }
    }
}
