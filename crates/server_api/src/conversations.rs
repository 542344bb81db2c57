use shared::{domain::UserId, error::ApiError, protocol::ConversationSummary};

use crate::{internal, ApiContext, UserDirectory};

/// The user's conversation list, most recently active first. Derived from
/// the stored messages on every call; nothing about it is cached.
pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let heads = ctx
        .storage
        .list_conversations(user_id)
        .await
        .map_err(internal)?;

    let mut directory = UserDirectory::default();
    let mut summaries = Vec::with_capacity(heads.len());
    for head in heads {
        let counterpart = directory.summary(ctx, head.counterpart_id).await?;
        let last_message = directory.payload(ctx, head.last_message).await?;
        summaries.push(ConversationSummary {
            counterpart,
            last_message,
            unread_count: head.unread_count,
        });
    }
    Ok(summaries)
}
