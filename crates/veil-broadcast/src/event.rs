//! The broadcast event envelope. One tagged enum instead of a string `type`
//! field with conditional payloads; the wire names keep the `family:action`
//! shape.

use serde::{Deserialize, Serialize};

/// Everything a conversation hub fans out. Ordering guarantees within one
/// send: `message:new` precedes every `message:stream` precedes
/// `message:complete`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ChatEvent {
    /// Start of a send. `content` carries the user plaintext only on
    /// AI-producing sends (for synchronous UI); user-only posts omit it.
    /// Ephemeral either way: plaintext is never persisted.
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew {
        conversation_id: String,
        message_id: String,
        sender_type: String,
        sender_id: Option<String>,
        sender_display_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Batched tokens, roughly one event per 100 ms of stream.
    #[serde(rename = "message:stream", rename_all = "camelCase")]
    MessageStream {
        conversation_id: String,
        message_id: String,
        tokens: String,
    },

    /// The authoritative pair after atomic commit. Blobs are hex-encoded
    /// ECIES ciphertext under the epoch key.
    #[serde(rename = "message:complete", rename_all = "camelCase")]
    MessageComplete {
        conversation_id: String,
        user_message_id: String,
        ai_message_id: String,
        epoch_number: u64,
        user_sequence: u64,
        ai_sequence: u64,
        payer_id: Option<String>,
        cost: String,
        user_blob: String,
        ai_blob: String,
    },

    #[serde(rename = "message:error", rename_all = "camelCase")]
    MessageError {
        conversation_id: String,
        message_id: String,
        code: String,
        message: String,
    },

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },

    #[serde(rename = "member:added", rename_all = "camelCase")]
    MemberAdded {
        conversation_id: String,
        member: String,
        privilege: String,
    },

    #[serde(rename = "member:removed", rename_all = "camelCase")]
    MemberRemoved {
        conversation_id: String,
        member: String,
    },

    #[serde(rename = "rotation:pending", rename_all = "camelCase")]
    RotationPending { conversation_id: String },

    #[serde(rename = "rotation:complete", rename_all = "camelCase")]
    RotationComplete {
        conversation_id: String,
        new_epoch_number: u64,
    },
}
