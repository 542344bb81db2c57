use std::collections::HashMap;

use shared::{
    domain::{MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        MessagePage, MessagePayload, PageInfo, Pagination, ServerEvent, UserSummary,
        MAX_CONTENT_CHARS,
    },
};
use storage::{Storage, StoredMessage};
use tracing::debug;

pub mod conversations;
pub mod presence;
pub mod receipts;

pub use conversations::list_conversations;
pub use presence::PresenceRegistry;
pub use receipts::{mark_read, ForbiddenReadLog};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: PresenceRegistry,
    pub forbidden_reads: ForbiddenReadLog,
}

impl ApiContext {
    pub fn new(storage: Storage, presence: PresenceRegistry) -> Self {
        Self {
            storage,
            presence,
            forbidden_reads: ForbiddenReadLog::default(),
        }
    }
}

/// Resolves display fields for push and list payloads, hitting the store at
/// most once per user.
#[derive(Default)]
pub(crate) struct UserDirectory {
    cache: HashMap<UserId, UserSummary>,
}

impl UserDirectory {
    pub(crate) async fn summary(&mut self, ctx: &ApiContext, user_id: UserId) -> Result<UserSummary, ApiError> {
        if let Some(cached) = self.cache.get(&user_id) {
            return Ok(cached.clone());
        }
        let username = ctx
            .storage
            .username_for_user(user_id)
            .await
            .map_err(internal)?
            .unwrap_or_else(|| format!("user-{}", user_id.0));
        let summary = UserSummary { user_id, username };
        self.cache.insert(user_id, summary.clone());
        Ok(summary)
    }

    pub(crate) async fn payload(
        &mut self,
        ctx: &ApiContext,
        message: StoredMessage,
    ) -> Result<MessagePayload, ApiError> {
        let sender = self.summary(ctx, message.sender_id).await?;
        let receiver = self.summary(ctx, message.receiver_id).await?;
        Ok(MessagePayload {
            message_id: message.message_id,
            sender,
            receiver,
            content: message.content,
            created_at: message.created_at,
            read_by: message.read_by,
        })
    }
}

pub fn validate_content(content: &str) -> Result<&str, ApiError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("message content cannot be empty"));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::validation(format!(
            "message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Persists a message and, if the receiver is connected, pushes it to them.
/// The push never fails the send.
pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    receiver_id: UserId,
    content: &str,
) -> Result<MessagePayload, ApiError> {
    let content = validate_content(content)?;
    if sender_id == receiver_id {
        return Err(ApiError::validation("cannot send a message to yourself"));
    }

    let mut directory = UserDirectory::default();
    let sender = ensure_user(ctx, sender_id, ErrorCode::Unauthorized, "unknown sender").await?;
    let receiver = ensure_user(ctx, receiver_id, ErrorCode::NotFound, "receiver not found").await?;
    directory.cache.insert(sender_id, sender);
    directory.cache.insert(receiver_id, receiver);

    let stored = ctx
        .storage
        .insert_message(sender_id, receiver_id, content)
        .await
        .map_err(internal)?;
    let payload = directory.payload(ctx, stored).await?;

    let delivered = ctx
        .presence
        .push(
            receiver_id,
            ServerEvent::NewMessage {
                message: payload.clone(),
            },
        )
        .await;
    debug!(
        message_id = payload.message_id.0,
        sender_id = sender_id.0,
        receiver_id = receiver_id.0,
        delivered,
        "message stored"
    );

    Ok(payload)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    other_user_id: UserId,
    pagination: Pagination,
) -> Result<MessagePage, ApiError> {
    ensure_user(ctx, other_user_id, ErrorCode::NotFound, "user not found").await?;
    let (page, limit) = pagination.resolve();
    let offset = u64::from(page - 1) * u64::from(limit);

    let total = ctx
        .storage
        .count_messages_between(user_id, other_user_id)
        .await
        .map_err(internal)?;
    let messages = ctx
        .storage
        .list_messages_between(user_id, other_user_id, limit, offset)
        .await
        .map_err(internal)?;

    let mut directory = UserDirectory::default();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        payloads.push(directory.payload(ctx, message).await?);
    }

    Ok(MessagePage {
        messages: payloads,
        pagination: PageInfo::new(page, limit, total),
    })
}

/// Hard-deletes one message. Only its sender or receiver may do so.
pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    if message.sender_id != user_id && message.receiver_id != user_id {
        return Err(ApiError::forbidden(
            "only participants can delete a message",
        ));
    }

    let deleted = ctx
        .storage
        .delete_message(message_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found("message not found"));
    }
    Ok(())
}

async fn ensure_user(
    ctx: &ApiContext,
    user_id: UserId,
    missing: ErrorCode,
    message: &str,
) -> Result<UserSummary, ApiError> {
    let user = ctx
        .storage
        .find_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(missing, message))?;
    Ok(UserSummary {
        user_id: user.user_id,
        username: user.username,
    })
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
