use jsonrpsee::core::{RpcResult, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;

use veil_broadcast::ChatEvent;
use veil_stream::StreamEvent;

use crate::types::{
    RpcAddMember, RpcConversation, RpcCreateConversation, RpcCreateLink, RpcLedgerEntry, RpcLink,
    RpcLinkView, RpcMessage, RpcPaymentEvent, RpcPostMessage, RpcPostedMessage, RpcRegisterAccount,
    RpcRegisteredAccount, RpcRotation, RpcRotationResult, RpcShare, RpcWallet, RpcWebhookAck,
};

/// Veil JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "veil_" via `namespace = "veil"`.
#[rpc(server, namespace = "veil")]
pub trait VeilApi {
    // ── Accounts ─────────────────────────────────────────────────────────────

    /// Provision an account (identity verification happened upstream): stores
    /// the wrapped-key blobs, creates both wallets, grants the welcome
    /// credit, and returns a session token.
    #[method(name = "registerAccount")]
    async fn register_account(&self, req: RpcRegisterAccount) -> RpcResult<RpcRegisteredAccount>;

    /// Delete the calling account: leaves all conversations (queueing
    /// rotations), deletes owned ones, preserves financial rows.
    #[method(name = "deleteAccount")]
    async fn delete_account(&self, session_token: String) -> RpcResult<bool>;

    // ── Conversations ────────────────────────────────────────────────────────

    /// Create a conversation from owner-generated first-epoch material.
    #[method(name = "createConversation")]
    async fn create_conversation(&self, req: RpcCreateConversation) -> RpcResult<RpcConversation>;

    /// Fetch a conversation as seen by the caller (their wrap, privilege,
    /// and visibility floor included).
    #[method(name = "getConversation")]
    async fn get_conversation(
        &self,
        session_token: String,
        conversation_id: String,
    ) -> RpcResult<RpcConversation>;

    /// Page messages by sequence number, floored by the caller's
    /// `visibleFromEpoch`.
    #[method(name = "listMessages")]
    async fn list_messages(
        &self,
        session_token: String,
        conversation_id: String,
        from_sequence: u64,
        limit: u32,
    ) -> RpcResult<Vec<RpcMessage>>;

    /// Owner-only: set or clear the per-person and conversation budgets
    /// (dollar strings).
    #[method(name = "setBudgets")]
    async fn set_budgets(
        &self,
        session_token: String,
        conversation_id: String,
        per_person_budget: Option<String>,
        conversation_budget: Option<String>,
    ) -> RpcResult<bool>;

    /// Replace the title blob (encrypted under the current epoch).
    #[method(name = "updateTitle")]
    async fn update_title(
        &self,
        session_token: String,
        conversation_id: String,
        encrypted_title: String,
    ) -> RpcResult<u64>;

    // ── Messaging ────────────────────────────────────────────────────────────

    /// User-only send (no AI reply).
    #[method(name = "postMessage")]
    async fn post_message(&self, req: RpcPostMessage) -> RpcResult<RpcPostedMessage>;

    /// Hard-delete a message (author or admin).
    #[method(name = "deleteMessage")]
    async fn delete_message(
        &self,
        session_token: String,
        conversation_id: String,
        message_id: String,
    ) -> RpcResult<bool>;

    /// The streaming send: `start`, `token`, `done` / `error` notifications.
    /// Errors before the stream starts reject the subscription with the
    /// error envelope; later failures arrive as `error` events.
    #[subscription(name = "subscribeStream", unsubscribe = "unsubscribeStream", item = StreamEvent)]
    async fn subscribe_stream(&self, req: crate::types::RpcSendMessage) -> SubscriptionResult;

    // ── Rotation ─────────────────────────────────────────────────────────────

    /// Atomic rotation submission. Reject codes: `stale-epoch`,
    /// `wrap-set-mismatch`.
    #[method(name = "submitRotation")]
    async fn submit_rotation(&self, req: RpcRotation) -> RpcResult<RpcRotationResult>;

    // ── Membership ───────────────────────────────────────────────────────────

    #[method(name = "addMember")]
    async fn add_member(&self, req: RpcAddMember) -> RpcResult<bool>;

    #[method(name = "removeMember")]
    async fn remove_member(
        &self,
        session_token: String,
        conversation_id: String,
        target_account_id: String,
    ) -> RpcResult<bool>;

    #[method(name = "leaveConversation")]
    async fn leave_conversation(
        &self,
        session_token: String,
        conversation_id: String,
    ) -> RpcResult<bool>;

    #[method(name = "setMemberPrivilege")]
    async fn set_member_privilege(
        &self,
        session_token: String,
        conversation_id: String,
        target_account_id: String,
        privilege: String,
    ) -> RpcResult<bool>;

    #[method(name = "createLink")]
    async fn create_link(&self, req: RpcCreateLink) -> RpcResult<RpcLink>;

    #[method(name = "revokeLink")]
    async fn revoke_link(
        &self,
        session_token: String,
        conversation_id: String,
        link_id: String,
    ) -> RpcResult<bool>;

    /// Anonymous link-guest entry: conversation view plus the link's current
    /// epoch wrap. Rate-limited per client IP.
    #[method(name = "linkAccess")]
    async fn link_access(&self, link_id: String, client_ip: Option<String>)
        -> RpcResult<RpcLinkView>;

    // ── Wallets / billing ────────────────────────────────────────────────────

    /// The caller's wallets (running the lazy free-tier renewal first).
    #[method(name = "getWalletBalances")]
    async fn get_wallet_balances(&self, session_token: String) -> RpcResult<Vec<RpcWallet>>;

    /// Append-order ledger for one of the caller's wallets.
    #[method(name = "getLedger")]
    async fn get_ledger(
        &self,
        session_token: String,
        wallet_id: String,
    ) -> RpcResult<Vec<RpcLedgerEntry>>;

    /// Payment-processor callback. Authenticated by the shared webhook
    /// secret, idempotent on the processor transaction id.
    #[method(name = "paymentWebhook")]
    async fn payment_webhook(
        &self,
        webhook_secret: String,
        event: RpcPaymentEvent,
    ) -> RpcResult<RpcWebhookAck>;

    // ── Shares ───────────────────────────────────────────────────────────────

    /// Store an out-of-band share blob (hex) and return its id.
    #[method(name = "shareMessage")]
    async fn share_message(&self, session_token: String, blob: String) -> RpcResult<String>;

    /// Fetch a share blob by id. No authentication: possession of the id
    /// (and the fragment secret to decrypt) is the capability.
    #[method(name = "getSharedMessage")]
    async fn get_shared_message(&self, share_id: String) -> RpcResult<RpcShare>;

    // ── Real-time feed ───────────────────────────────────────────────────────

    /// Per-conversation event feed (the broadcast fabric). Members connect
    /// with a session token; guests with a link id (+ display name).
    #[subscription(
        name = "subscribeConversation",
        unsubscribe = "unsubscribeConversation",
        item = ChatEvent
    )]
    async fn subscribe_conversation(
        &self,
        conversation_id: String,
        session_token: Option<String>,
        link_id: Option<String>,
        display_name: Option<String>,
    ) -> SubscriptionResult;
}
