//! JSON-serializable request/response shapes. Binary material (keys, wraps,
//! blobs) travels hex-encoded; money travels as dollar strings.

use serde::{Deserialize, Serialize};

// ── Accounts / sessions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRegisterAccount {
    pub email: String,
    pub username: String,
    /// X25519 public key, hex.
    pub public_key: String,
    /// Private key wrapped under the password-derived key, hex.
    pub password_wrapped_key: String,
    /// Private key wrapped under the recovery-phrase-derived key, hex.
    pub recovery_wrapped_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRegisteredAccount {
    pub account_id: String,
    pub session_token: String,
    pub purchased_wallet_id: String,
    pub free_wallet_id: String,
}

// ── Conversations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCreateConversation {
    pub session_token: String,
    pub epoch_public_key: String,
    pub confirmation_hash: String,
    pub owner_wrap: String,
    pub encrypted_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConversation {
    pub conversation_id: String,
    pub owner: String,
    pub current_epoch: u64,
    pub rotation_pending: bool,
    pub per_person_budget: Option<String>,
    pub conversation_budget: Option<String>,
    pub encrypted_title: Option<String>,
    pub title_epoch: u64,
    /// The caller's own privilege and visibility floor.
    pub privilege: String,
    pub visible_from_epoch: u64,
    /// Current-epoch material for the caller: public key, confirmation
    /// hash, and the caller's wrap.
    pub epoch_public_key: String,
    pub epoch_confirmation_hash: String,
    pub wrapped_epoch_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    pub message_id: String,
    pub epoch_number: u64,
    pub sequence_number: u64,
    pub sender_type: String,
    pub sender_id: Option<String>,
    pub sender_display_name: Option<String>,
    pub payer_id: Option<String>,
    pub cost: String,
    pub blob: String,
    pub created_at: i64,
}

// ── Sends ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcChatTurn {
    pub role: String,
    pub content: String,
}

/// Rotation material piggybacked on a send, so a conversation flagged
/// `rotation-required` rotates and sends in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcInlineRotation {
    pub expected_epoch: u64,
    pub new_epoch_public_key: String,
    pub confirmation_hash: String,
    pub member_wraps: Vec<RpcMemberWrap>,
    pub chain_link: String,
    pub encrypted_title: Option<String>,
}

/// Body of both the streaming send and the subscription that carries it.
/// Exactly one of `session_token` (account member) or `link_id` (guest) is
/// set; guests also carry a display name and the gateway-injected client IP
/// for rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSendMessage {
    pub session_token: Option<String>,
    pub link_id: Option<String>,
    pub display_name: Option<String>,
    pub client_ip: Option<String>,
    pub conversation_id: String,
    pub model: String,
    pub message_id: String,
    pub content: String,
    pub messages_for_inference: Vec<RpcChatTurn>,
    pub funding_source: String,
    /// Set when retrying after a `rotation-required` signal.
    #[serde(default)]
    pub rotation: Option<RpcInlineRotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPostMessage {
    pub session_token: Option<String>,
    pub link_id: Option<String>,
    pub display_name: Option<String>,
    pub client_ip: Option<String>,
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPostedMessage {
    pub message_id: String,
    pub sequence_number: u64,
    pub epoch_number: u64,
}

// ── Rotation ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMemberWrap {
    pub member_public_key: String,
    pub wrapped_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRotation {
    pub session_token: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub rotation: RpcInlineRotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRotationResult {
    pub new_epoch_number: u64,
}

// ── Membership ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAddMember {
    pub session_token: String,
    pub conversation_id: String,
    pub target_account_id: String,
    pub wrapped_key: String,
    pub privilege: String,
    pub visible_from_epoch: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCreateLink {
    pub session_token: String,
    pub conversation_id: String,
    pub link_public_key: String,
    pub wrapped_key: String,
    pub privilege: String,
    pub visible_from_epoch: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLink {
    pub link_id: String,
    pub privilege: String,
    pub visible_from_epoch: u64,
}

/// What a link guest gets back from `linkAccess`: enough to join the
/// conversation with nothing but the fragment secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLinkView {
    pub conversation_id: String,
    pub current_epoch: u64,
    pub epoch_public_key: String,
    pub epoch_confirmation_hash: String,
    pub wrapped_epoch_key: String,
    pub privilege: String,
    pub visible_from_epoch: u64,
    pub encrypted_title: Option<String>,
    pub title_epoch: u64,
}

// ── Wallets / billing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcWallet {
    pub wallet_id: String,
    pub kind: String,
    pub balance: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLedgerEntry {
    pub index: u64,
    pub amount: String,
    pub balance_after: String,
    pub entry_type: String,
    /// The single reference the entry carries: payment id, usage id, or
    /// source wallet id.
    pub reference: String,
    pub created_at: i64,
}

/// Payment-processor webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPaymentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcWebhookAck {
    pub received: bool,
}

// ── Shares ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcShare {
    pub share_id: String,
    pub blob: String,
}
