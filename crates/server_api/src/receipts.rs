use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::{
    domain::{MessageId, UserId},
    error::ApiError,
    protocol::{MessageReadPayload, ServerEvent},
};
use tracing::{debug, error, warn};

use crate::{internal, ApiContext};

/// Readers tracked at once by [`ForbiddenReadLog`].
pub const DEFAULT_TRACKED_READERS: usize = 4096;

/// Counts rejected mark-read attempts per reader so a repeat offender is
/// escalated in the logs. Bounded: when full, one-time offenders are
/// forgotten first, then everyone.
#[derive(Clone)]
pub struct ForbiddenReadLog {
    attempts: Arc<Mutex<HashMap<UserId, u32>>>,
    capacity: usize,
}

impl Default for ForbiddenReadLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACKED_READERS)
    }
}

impl ForbiddenReadLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            attempts: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, reader_id: UserId, message_id: MessageId) -> u32 {
        let attempts = {
            let mut guard = self
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !guard.contains_key(&reader_id) && guard.len() >= self.capacity {
                guard.retain(|_, count| *count > 1);
                if guard.len() >= self.capacity {
                    guard.clear();
                }
            }
            let count = guard.entry(reader_id).or_insert(0);
            *count += 1;
            *count
        };

        if attempts > 1 {
            error!(
                reader_id = reader_id.0,
                message_id = message_id.0,
                attempts,
                "receipts: repeated attempt to mark another user's message read; possible integrity violation"
            );
        } else {
            warn!(
                reader_id = reader_id.0,
                message_id = message_id.0,
                "receipts: reader is not the receiver of this message"
            );
        }
        attempts
    }

    pub fn attempts(&self, reader_id: UserId) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&reader_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Marks a message read by its receiver and notifies the sender the first
/// time. Repeats are no-ops: the store only accepts one receipt per reader,
/// so concurrent duplicates race on a single insert and at most one of them
/// pushes `messageRead`.
pub async fn mark_read(
    ctx: &ApiContext,
    message_id: MessageId,
    reader_id: UserId,
) -> Result<(), ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;

    if message.receiver_id != reader_id {
        ctx.forbidden_reads.record(reader_id, message_id);
        return Err(ApiError::forbidden(
            "only the receiver can mark a message as read",
        ));
    }

    if message.is_read_by(reader_id) {
        debug!(
            message_id = message_id.0,
            reader_id = reader_id.0,
            "receipts: already read"
        );
        return Ok(());
    }

    let Some(receipt) = ctx
        .storage
        .insert_read_receipt(message_id, reader_id)
        .await
        .map_err(internal)?
    else {
        // Either a concurrent duplicate won, or the message was deleted
        // since it was loaded.
        let exists = ctx
            .storage
            .load_message(message_id)
            .await
            .map_err(internal)?
            .is_some();
        if !exists {
            return Err(ApiError::not_found("message not found"));
        }
        return Ok(());
    };

    ctx.presence
        .push(
            message.sender_id,
            ServerEvent::MessageRead(MessageReadPayload {
                message_id,
                reader_id,
                read_at: receipt.read_at,
            }),
        )
        .await;
    Ok(())
}
