//! Message rows and the per-message billing artifacts (usage records and LLM
//! completions), plus standalone shared messages.

use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, ConversationId, Credits, EpochNumber, MessageId, SenderType, SequenceNumber,
    ShareId, Timestamp, UsageId,
};

// ── Message ──────────────────────────────────────────────────────────────────

/// One persisted message. The blob is ECIES ciphertext under the public key
/// of `epoch_number`'s epoch; plaintext is never stored. Insert-only, but
/// hard deletion is allowed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub epoch_number: EpochNumber,
    pub sequence_number: SequenceNumber,
    pub sender_type: SenderType,
    /// `None` for AI messages and anonymous link guests.
    pub sender_account: Option<AccountId>,
    /// Captured display name for link guests.
    pub sender_display_name: Option<String>,
    /// Who was debited for the AI reply this message belongs to.
    pub payer_account: Option<AccountId>,
    pub cost: Credits,
    pub blob: Vec<u8>,
    pub created_at: Timestamp,
}

// ── Billing artifacts ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Pending,
    Completed,
    Failed,
}

/// Billing record for one AI completion. Created `pending` inside the commit
/// transaction and flipped to `completed` once the debit lands; a `completed`
/// usage record always has exactly one `usage_charge` ledger entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub usage_id: UsageId,
    pub account_id: Option<AccountId>,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub status: UsageStatus,
    pub total_cost: Credits,
    pub created_at: Timestamp,
}

/// Provider-reported completion metadata, one-to-one with a usage record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub usage_id: UsageId,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

// ── Shared messages ──────────────────────────────────────────────────────────

/// A message shared out of band: an independent ECIES blob keyed by a random
/// share secret. Deliberately unrelated to any conversation or epoch key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedMessage {
    pub share_id: ShareId,
    pub blob: Vec<u8>,
    pub created_at: Timestamp,
}
