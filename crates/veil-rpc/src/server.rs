use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::core::{async_trait, RpcResult, SubscriptionResult};
use jsonrpsee::server::{PendingSubscriptionSink, Server, ServerHandle, SubscriptionMessage};
use jsonrpsee::types::ErrorObject;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use veil_billing::{RateLimiter, SendPrincipal};
use veil_broadcast::{HubRegistry, SubscriberIdentity};
use veil_core::account::LedgerCause;
use veil_core::conversation::{Conversation, ConversationMember};
use veil_core::types::{
    credits_from_dollars, credits_to_dollars, AccountId, ConversationId, Credits, FundingSource,
    LinkId, MessageId, Principal, Privilege, ShareId, WalletId,
};
use veil_core::{Clock, VeilError};
use veil_epoch::keys::MemberWrap;
use veil_epoch::{EpochManager, RotationSubmission};
use veil_roster::{FirstEpochSubmission, RosterService};
use veil_store::StoreDb;
use veil_stream::{ChatTurn, Role, SendRequest, StreamPipeline};
use veil_wallet::{
    apply_payment_with_retry, ensure_free_tier_current, register_account, NewAccount,
};

use crate::api::VeilApiServer;
use crate::auth::SessionRegistry;
use crate::types::{
    RpcAddMember, RpcConversation, RpcCreateConversation, RpcCreateLink, RpcLedgerEntry, RpcLink,
    RpcLinkView, RpcMessage, RpcPaymentEvent, RpcPostMessage, RpcPostedMessage, RpcRegisterAccount,
    RpcRegisteredAccount, RpcRotation, RpcRotationResult, RpcSendMessage, RpcShare, RpcWallet,
    RpcWebhookAck,
};

const WEBHOOK_RETRY_ATTEMPTS: u32 = 3;
const WEBHOOK_RETRY_DELAY: Duration = Duration::from_millis(200);

// ── Error envelope ───────────────────────────────────────────────────────────

/// Map a core error onto the wire envelope: numeric code = HTTP status,
/// `data = {code, details?}` carries the machine-actionable part.
fn veil_err(e: &VeilError) -> ErrorObject<'static> {
    let details = match e {
        VeilError::PremiumRequiresBalance { current_balance } => Some(serde_json::json!({
            "currentBalance": credits_to_dollars(*current_balance),
        })),
        VeilError::BillingMismatch { server_source } => Some(serde_json::json!({
            "serverFundingSource": server_source.as_str(),
        })),
        VeilError::StaleEpoch { current, .. } => Some(serde_json::json!({
            "currentEpoch": current,
        })),
        VeilError::RotationRequired { current_epoch, pending_removals } => {
            Some(serde_json::json!({
                "currentEpoch": current_epoch,
                "pendingRemovals": pending_removals,
            }))
        }
        VeilError::RateLimited { retry_after_secs } => Some(serde_json::json!({
            "retryAfterSecs": retry_after_secs,
        })),
        _ => None,
    };
    let data = serde_json::json!({ "code": e.code(), "details": details });
    ErrorObject::owned(e.http_status() as i32, e.to_string(), Some(data))
}

fn invalid_params(msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(-32602, msg.into(), None::<()>)
}

// ── Param parsing ────────────────────────────────────────────────────────────

fn hex_bytes(s: &str, what: &str) -> Result<Vec<u8>, ErrorObject<'static>> {
    hex::decode(s).map_err(|e| invalid_params(format!("invalid {what}: {e}")))
}

fn hex_32(s: &str, what: &str) -> Result<[u8; 32], ErrorObject<'static>> {
    let bytes = hex_bytes(s, what)?;
    bytes
        .try_into()
        .map_err(|_| invalid_params(format!("invalid {what}: expected 32 bytes")))
}

fn parse_privilege(s: &str) -> Result<Privilege, ErrorObject<'static>> {
    match s {
        "read" => Ok(Privilege::Read),
        "write" => Ok(Privilege::Write),
        "admin" => Ok(Privilege::Admin),
        _ => Err(invalid_params(format!("invalid privilege: {s}"))),
    }
}

fn parse_funding(s: &str) -> Result<FundingSource, ErrorObject<'static>> {
    match s {
        "personal_balance" => Ok(FundingSource::PersonalBalance),
        "owner_balance" => Ok(FundingSource::OwnerBalance),
        "free_allowance" => Ok(FundingSource::FreeAllowance),
        _ => Err(invalid_params(format!("invalid funding source: {s}"))),
    }
}

fn parse_role(s: &str) -> Result<Role, ErrorObject<'static>> {
    match s {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        _ => Err(invalid_params(format!("invalid role: {s}"))),
    }
}

fn parse_dollars(s: &str, what: &str) -> Result<Credits, ErrorObject<'static>> {
    credits_from_dollars(s).ok_or_else(|| invalid_params(format!("invalid {what}: {s}")))
}

fn parse_inline_rotation(
    r: &crate::types::RpcInlineRotation,
) -> Result<RotationSubmission, ErrorObject<'static>> {
    let mut member_wraps = Vec::with_capacity(r.member_wraps.len());
    for wrap in &r.member_wraps {
        member_wraps.push(MemberWrap {
            member_public_key: hex_32(&wrap.member_public_key, "member public key")?,
            wrapped_key: hex_bytes(&wrap.wrapped_key, "wrapped key")?,
        });
    }
    Ok(RotationSubmission {
        expected_epoch: r.expected_epoch,
        new_epoch_public_key: hex_32(&r.new_epoch_public_key, "epoch public key")?,
        confirmation_hash: hex_32(&r.confirmation_hash, "confirmation hash")?,
        member_wraps,
        chain_link: hex_bytes(&r.chain_link, "chain link")?,
        encrypted_title: r
            .encrypted_title
            .as_deref()
            .map(|t| hex_bytes(t, "title"))
            .transpose()?,
    })
}

// ── Server state ─────────────────────────────────────────────────────────────

pub struct RpcServerState {
    pub db: Arc<StoreDb>,
    pub pipeline: Arc<StreamPipeline>,
    pub roster: Arc<RosterService>,
    pub epochs: Arc<EpochManager>,
    pub hubs: Arc<HubRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub clock: Arc<dyn Clock>,
    pub webhook_secret: String,
    pub welcome_credit: Credits,
    pub free_allowance: Credits,
    pub guest_access_limiter: RateLimiter,
    pub guest_send_limiter: RateLimiter,
}

pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server (HTTP + WS) on `addr` with permissive CORS
    /// headers. Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

// ── View builders ────────────────────────────────────────────────────────────

impl RpcServerState {
    fn resolve_session(&self, token: &str) -> Result<AccountId, ErrorObject<'static>> {
        self.sessions.resolve(token).map_err(|e| veil_err(&e))
    }

    fn conversation_view(
        &self,
        conv: &Conversation,
        member: &ConversationMember,
        wrap_target: Option<&[u8; 32]>,
    ) -> Result<RpcConversation, VeilError> {
        let epoch = self
            .db
            .get_epoch(&conv.conversation_id, conv.current_epoch)?
            .ok_or_else(|| VeilError::Internal("current epoch row missing".into()))?;
        let wrapped_epoch_key = match wrap_target {
            Some(pk) => self
                .db
                .get_wrap(&conv.conversation_id, conv.current_epoch, pk)?
                .map(|w| hex::encode(w.wrapped_key)),
            None => None,
        };
        Ok(RpcConversation {
            conversation_id: conv.conversation_id.to_hex(),
            owner: conv.owner.to_b58(),
            current_epoch: conv.current_epoch,
            rotation_pending: conv.rotation_pending,
            per_person_budget: conv.per_person_budget.map(credits_to_dollars),
            conversation_budget: conv.conversation_budget.map(credits_to_dollars),
            encrypted_title: conv.title.as_ref().map(hex::encode),
            title_epoch: conv.title_epoch,
            privilege: member.privilege.as_str().to_string(),
            visible_from_epoch: member.visible_from_epoch,
            epoch_public_key: hex::encode(epoch.public_key),
            epoch_confirmation_hash: hex::encode(epoch.confirmation_hash),
            wrapped_epoch_key,
        })
    }
}

fn message_view(m: &veil_core::message::Message) -> RpcMessage {
    RpcMessage {
        message_id: m.message_id.to_hex(),
        epoch_number: m.epoch_number,
        sequence_number: m.sequence_number,
        sender_type: m.sender_type.as_str().to_string(),
        sender_id: m.sender_account.map(|a| a.to_b58()),
        sender_display_name: m.sender_display_name.clone(),
        payer_id: m.payer_account.map(|a| a.to_b58()),
        cost: credits_to_dollars(m.cost),
        blob: hex::encode(&m.blob),
        created_at: m.created_at,
    }
}

fn ledger_view(e: &veil_core::account::LedgerEntry) -> RpcLedgerEntry {
    let reference = match &e.cause {
        LedgerCause::Deposit { payment_id } => payment_id.clone(),
        LedgerCause::UsageCharge { usage_id } | LedgerCause::Refund { usage_id } => {
            usage_id.to_hex()
        }
        LedgerCause::Adjustment { source_wallet }
        | LedgerCause::Renewal { source_wallet }
        | LedgerCause::WelcomeCredit { source_wallet } => source_wallet.to_hex(),
    };
    RpcLedgerEntry {
        index: e.index,
        amount: credits_to_dollars(e.amount),
        balance_after: credits_to_dollars(e.balance_after),
        entry_type: e.cause.kind_str().to_string(),
        reference,
        created_at: e.created_at,
    }
}

// ── API implementation ───────────────────────────────────────────────────────

#[async_trait]
impl VeilApiServer for RpcServer {
    async fn register_account(&self, req: RpcRegisterAccount) -> RpcResult<RpcRegisteredAccount> {
        let public_key = hex_32(&req.public_key, "public key")?;
        let password_wrapped_key = hex_bytes(&req.password_wrapped_key, "password wrap")?;
        let recovery_wrapped_key = hex_bytes(&req.recovery_wrapped_key, "recovery wrap")?;

        let provisioned = register_account(
            &self.state.db,
            NewAccount {
                email: req.email,
                username: req.username,
                public_key,
                password_wrapped_key,
                recovery_wrapped_key,
            },
            self.state.welcome_credit,
            self.state.clock.now(),
        )
        .map_err(|e| veil_err(&e))?;

        let session_token = self.state.sessions.issue(provisioned.account.account_id);
        Ok(RpcRegisteredAccount {
            account_id: provisioned.account.account_id.to_b58(),
            session_token,
            purchased_wallet_id: provisioned.purchased_wallet.to_hex(),
            free_wallet_id: provisioned.free_wallet.to_hex(),
        })
    }

    async fn delete_account(&self, session_token: String) -> RpcResult<bool> {
        let account = self.state.resolve_session(&session_token)?;
        self.state.roster.delete_account(account).map_err(|e| veil_err(&e))?;
        self.state.sessions.revoke_account(&account);
        Ok(true)
    }

    async fn create_conversation(&self, req: RpcCreateConversation) -> RpcResult<RpcConversation> {
        let owner = self.state.resolve_session(&req.session_token)?;
        let first = FirstEpochSubmission {
            epoch_public_key: hex_32(&req.epoch_public_key, "epoch public key")?,
            confirmation_hash: hex_32(&req.confirmation_hash, "confirmation hash")?,
            owner_wrap: hex_bytes(&req.owner_wrap, "owner wrap")?,
            encrypted_title: req
                .encrypted_title
                .as_deref()
                .map(|t| hex_bytes(t, "title"))
                .transpose()?,
        };
        let conv = self
            .state
            .roster
            .create_conversation(owner, first)
            .map_err(|e| veil_err(&e))?;
        let (conv, member) = self
            .state
            .roster
            .require_active_member(&conv.conversation_id, &Principal::Account(owner))
            .map_err(|e| veil_err(&e))?;
        let owner_pk = self
            .state
            .db
            .get_account(&owner)
            .map_err(|e| veil_err(&e))?
            .map(|a| a.public_key);
        self.state
            .conversation_view(&conv, &member, owner_pk.as_ref())
            .map_err(|e| veil_err(&e))
    }

    async fn get_conversation(
        &self,
        session_token: String,
        conversation_id: String,
    ) -> RpcResult<RpcConversation> {
        let account = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let (conv, member) = self
            .state
            .roster
            .require_active_member(&conversation_id, &Principal::Account(account))
            .map_err(|e| veil_err(&e))?;
        let pk = self
            .state
            .db
            .get_account(&account)
            .map_err(|e| veil_err(&e))?
            .map(|a| a.public_key);
        self.state
            .conversation_view(&conv, &member, pk.as_ref())
            .map_err(|e| veil_err(&e))
    }

    async fn list_messages(
        &self,
        session_token: String,
        conversation_id: String,
        from_sequence: u64,
        limit: u32,
    ) -> RpcResult<Vec<RpcMessage>> {
        let account = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let limit = limit.min(200) as usize;
        let messages = self
            .state
            .pipeline
            .list_messages(conversation_id, &Principal::Account(account), from_sequence, limit)
            .map_err(|e| veil_err(&e))?;
        Ok(messages.iter().map(message_view).collect())
    }

    async fn set_budgets(
        &self,
        session_token: String,
        conversation_id: String,
        per_person_budget: Option<String>,
        conversation_budget: Option<String>,
    ) -> RpcResult<bool> {
        let account = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let per_person = per_person_budget
            .as_deref()
            .map(|s| parse_dollars(s, "per-person budget"))
            .transpose()?;
        let conversation = conversation_budget
            .as_deref()
            .map(|s| parse_dollars(s, "conversation budget"))
            .transpose()?;
        self.state
            .roster
            .set_budgets(&conversation_id, account, per_person, conversation)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn update_title(
        &self,
        session_token: String,
        conversation_id: String,
        encrypted_title: String,
    ) -> RpcResult<u64> {
        let account = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let blob = hex_bytes(&encrypted_title, "title")?;
        self.state
            .roster
            .update_title(&conversation_id, account, blob)
            .map_err(|e| veil_err(&e))
    }

    async fn post_message(&self, req: RpcPostMessage) -> RpcResult<RpcPostedMessage> {
        let conversation_id = ConversationId::from_hex(&req.conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let message_id = MessageId::from_hex(&req.message_id)
            .map_err(|_| invalid_params("invalid message id"))?;
        let sender = self.sender_for(
            req.session_token.as_deref(),
            req.link_id.as_deref(),
            req.client_ip.as_deref(),
        )?;
        let posted = self
            .state
            .pipeline
            .post_message(conversation_id, sender, req.display_name, message_id, req.content)
            .await
            .map_err(|e| veil_err(&e))?;
        Ok(RpcPostedMessage {
            message_id: message_id.to_hex(),
            sequence_number: posted.sequence_number,
            epoch_number: posted.epoch_number,
        })
    }

    async fn delete_message(
        &self,
        session_token: String,
        conversation_id: String,
        message_id: String,
    ) -> RpcResult<bool> {
        let account = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let message_id = MessageId::from_hex(&message_id)
            .map_err(|_| invalid_params("invalid message id"))?;
        self.state
            .pipeline
            .delete_message(conversation_id, &SendPrincipal::Account(account), message_id)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn subscribe_stream(
        &self,
        pending: PendingSubscriptionSink,
        req: RpcSendMessage,
    ) -> SubscriptionResult {
        let request = match self.build_send_request(&req) {
            Ok(r) => r,
            Err(e) => {
                pending.reject(e).await;
                return Ok(());
            }
        };

        // A retry after `rotation-required` carries the rotation inline; it
        // commits (serialized on the conversation lock) before the send runs
        // against the new epoch.
        if let Some(rotation) = &req.rotation {
            let submission = match parse_inline_rotation(rotation) {
                Ok(s) => s,
                Err(e) => {
                    pending.reject(e).await;
                    return Ok(());
                }
            };
            if let Err(e) = self
                .state
                .epochs
                .submit_rotation(request.conversation_id, &request.sender.principal(), submission)
                .await
            {
                pending.reject(veil_err(&e)).await;
                return Ok(());
            }
        }

        // The pipeline runs detached: once the model has answered, commit
        // and fan-out finish even if this subscriber vanishes.
        let (tx, mut rx) = mpsc::channel(256);
        let pipeline = Arc::clone(&self.state.pipeline);
        let mut task = tokio::spawn(async move { pipeline.send_message(request, tx).await });

        tokio::select! {
            first = rx.recv() => {
                let sink = match pending.accept().await {
                    Ok(s) => s,
                    Err(_) => return Ok(()), // client already gone; pipeline continues
                };
                let mut next = first;
                while let Some(event) = next {
                    let msg = SubscriptionMessage::from_json(&event)
                        .map_err(|e| e.to_string())?;
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    next = rx.recv().await;
                }
            }
            joined = &mut task => {
                match joined {
                    Ok(Err(e)) => pending.reject(veil_err(&e)).await,
                    Ok(Ok(())) => {
                        // Finished with no events: accept and close.
                        let _ = pending.accept().await;
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "send task panicked");
                        pending
                            .reject(veil_err(&VeilError::Internal("send task failed".into())))
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn submit_rotation(&self, req: RpcRotation) -> RpcResult<RpcRotationResult> {
        let account = self.state.resolve_session(&req.session_token)?;
        let conversation_id = ConversationId::from_hex(&req.conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let submission = parse_inline_rotation(&req.rotation)?;
        let new_epoch_number = self
            .state
            .epochs
            .submit_rotation(conversation_id, &Principal::Account(account), submission)
            .await
            .map_err(|e| veil_err(&e))?;
        Ok(RpcRotationResult { new_epoch_number })
    }

    async fn add_member(&self, req: RpcAddMember) -> RpcResult<bool> {
        let actor = self.state.resolve_session(&req.session_token)?;
        let conversation_id = ConversationId::from_hex(&req.conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let target = AccountId::from_b58(&req.target_account_id)
            .map_err(|_| invalid_params("invalid target account id"))?;
        let wrapped_key = hex_bytes(&req.wrapped_key, "wrapped key")?;
        let privilege = parse_privilege(&req.privilege)?;
        self.state
            .roster
            .add_member(&conversation_id, actor, target, wrapped_key, privilege, req.visible_from_epoch)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn remove_member(
        &self,
        session_token: String,
        conversation_id: String,
        target_account_id: String,
    ) -> RpcResult<bool> {
        let actor = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let target = AccountId::from_b58(&target_account_id)
            .map_err(|_| invalid_params("invalid target account id"))?;
        self.state
            .roster
            .remove_member(&conversation_id, actor, target)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn leave_conversation(
        &self,
        session_token: String,
        conversation_id: String,
    ) -> RpcResult<bool> {
        let actor = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        self.state
            .roster
            .leave(&conversation_id, actor)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn set_member_privilege(
        &self,
        session_token: String,
        conversation_id: String,
        target_account_id: String,
        privilege: String,
    ) -> RpcResult<bool> {
        let actor = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let target = AccountId::from_b58(&target_account_id)
            .map_err(|_| invalid_params("invalid target account id"))?;
        let privilege = parse_privilege(&privilege)?;
        self.state
            .roster
            .set_privilege(&conversation_id, actor, target, privilege)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn create_link(&self, req: RpcCreateLink) -> RpcResult<RpcLink> {
        let actor = self.state.resolve_session(&req.session_token)?;
        let conversation_id = ConversationId::from_hex(&req.conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let link_public_key = hex_32(&req.link_public_key, "link public key")?;
        let wrapped_key = hex_bytes(&req.wrapped_key, "wrapped key")?;
        let privilege = parse_privilege(&req.privilege)?;
        let link = self
            .state
            .roster
            .create_link(
                &conversation_id,
                actor,
                link_public_key,
                wrapped_key,
                privilege,
                req.visible_from_epoch,
            )
            .map_err(|e| veil_err(&e))?;
        Ok(RpcLink {
            link_id: link.link_id.to_hex(),
            privilege: link.privilege.as_str().to_string(),
            visible_from_epoch: link.visible_from_epoch,
        })
    }

    async fn revoke_link(
        &self,
        session_token: String,
        conversation_id: String,
        link_id: String,
    ) -> RpcResult<bool> {
        let actor = self.state.resolve_session(&session_token)?;
        let conversation_id = ConversationId::from_hex(&conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let link_id =
            LinkId::from_hex(&link_id).map_err(|_| invalid_params("invalid link id"))?;
        self.state
            .roster
            .revoke_link(&conversation_id, actor, link_id)
            .map_err(|e| veil_err(&e))?;
        Ok(true)
    }

    async fn link_access(
        &self,
        link_id: String,
        client_ip: Option<String>,
    ) -> RpcResult<RpcLinkView> {
        let link_id =
            LinkId::from_hex(&link_id).map_err(|_| invalid_params("invalid link id"))?;
        let rate_key = client_ip.unwrap_or_else(|| link_id.to_hex());
        self.state
            .guest_access_limiter
            .check(&rate_key, self.state.clock.now())
            .map_err(|e| veil_err(&e))?;

        let link = self
            .state
            .db
            .get_link(&link_id)
            .map_err(|e| veil_err(&e))?
            .filter(|l| l.is_active())
            .ok_or_else(|| veil_err(&VeilError::ConversationNotFound))?;
        let (conv, member) = self
            .state
            .roster
            .require_active_member(&link.conversation_id, &Principal::Link(link_id))
            .map_err(|e| veil_err(&e))?;
        let epoch = self
            .state
            .db
            .get_epoch(&conv.conversation_id, conv.current_epoch)
            .map_err(|e| veil_err(&e))?
            .ok_or_else(|| veil_err(&VeilError::Internal("current epoch row missing".into())))?;
        let wrap = self
            .state
            .db
            .get_wrap(&conv.conversation_id, conv.current_epoch, &link.public_key)
            .map_err(|e| veil_err(&e))?
            .ok_or_else(|| veil_err(&VeilError::ConversationNotFound))?;

        Ok(RpcLinkView {
            conversation_id: conv.conversation_id.to_hex(),
            current_epoch: conv.current_epoch,
            epoch_public_key: hex::encode(epoch.public_key),
            epoch_confirmation_hash: hex::encode(epoch.confirmation_hash),
            wrapped_epoch_key: hex::encode(wrap.wrapped_key),
            privilege: member.privilege.as_str().to_string(),
            visible_from_epoch: member.visible_from_epoch,
            encrypted_title: conv.title.as_ref().map(hex::encode),
            title_epoch: conv.title_epoch,
        })
    }

    async fn get_wallet_balances(&self, session_token: String) -> RpcResult<Vec<RpcWallet>> {
        let account = self.state.resolve_session(&session_token)?;
        ensure_free_tier_current(
            &self.state.db,
            &account,
            self.state.free_allowance,
            self.state.clock.now(),
        )
        .map_err(|e| veil_err(&e))?;
        let wallets = self
            .state
            .db
            .wallets_for_account(&account)
            .map_err(|e| veil_err(&e))?;
        Ok(wallets
            .iter()
            .map(|w| RpcWallet {
                wallet_id: w.wallet_id.to_hex(),
                kind: match w.kind {
                    veil_core::types::WalletKind::Purchased => "purchased".to_string(),
                    veil_core::types::WalletKind::FreeTier => "free_tier".to_string(),
                },
                balance: credits_to_dollars(w.balance),
                priority: w.priority,
            })
            .collect())
    }

    async fn get_ledger(
        &self,
        session_token: String,
        wallet_id: String,
    ) -> RpcResult<Vec<RpcLedgerEntry>> {
        let account = self.state.resolve_session(&session_token)?;
        let wallet_id =
            WalletId::from_hex(&wallet_id).map_err(|_| invalid_params("invalid wallet id"))?;
        let wallet = self
            .state
            .db
            .get_wallet(&wallet_id)
            .map_err(|e| veil_err(&e))?
            .filter(|w| w.owner == Some(account))
            .ok_or_else(|| veil_err(&VeilError::WalletNotFound(wallet_id.to_hex())))?;
        let entries = self
            .state
            .db
            .ledger_for_wallet(&wallet.wallet_id)
            .map_err(|e| veil_err(&e))?;
        Ok(entries.iter().map(ledger_view).collect())
    }

    async fn payment_webhook(
        &self,
        webhook_secret: String,
        event: RpcPaymentEvent,
    ) -> RpcResult<RpcWebhookAck> {
        if webhook_secret != self.state.webhook_secret {
            return Err(veil_err(&VeilError::WebhookUnauthorized));
        }
        if event.event_type != "cardTransaction" {
            // Unknown event families are acknowledged and ignored.
            return Ok(RpcWebhookAck { received: true });
        }
        apply_payment_with_retry(
            &self.state.db,
            &event.id,
            self.state.clock.now(),
            WEBHOOK_RETRY_ATTEMPTS,
            WEBHOOK_RETRY_DELAY,
        )
        .await
        .map_err(|e| veil_err(&e))?;
        Ok(RpcWebhookAck { received: true })
    }

    async fn share_message(&self, session_token: String, blob: String) -> RpcResult<String> {
        self.state.resolve_session(&session_token)?;
        let blob = hex_bytes(&blob, "share blob")?;
        let share_id = self
            .state
            .pipeline
            .share_message(blob)
            .map_err(|e| veil_err(&e))?;
        Ok(share_id.to_hex())
    }

    async fn get_shared_message(&self, share_id: String) -> RpcResult<RpcShare> {
        let share_id =
            ShareId::from_hex(&share_id).map_err(|_| invalid_params("invalid share id"))?;
        let share = self
            .state
            .pipeline
            .get_shared_message(&share_id)
            .map_err(|e| veil_err(&e))?;
        Ok(RpcShare {
            share_id: share.share_id.to_hex(),
            blob: hex::encode(&share.blob),
        })
    }

    async fn subscribe_conversation(
        &self,
        pending: PendingSubscriptionSink,
        conversation_id: String,
        session_token: Option<String>,
        link_id: Option<String>,
        display_name: Option<String>,
    ) -> SubscriptionResult {
        let setup = (|| {
            let conversation_id = ConversationId::from_hex(&conversation_id)
                .map_err(|_| invalid_params("invalid conversation id"))?;
            let (principal, identity) = match (&session_token, &link_id) {
                (Some(token), _) => {
                    let account = self.state.resolve_session(token)?;
                    (Principal::Account(account), SubscriberIdentity::Account(account))
                }
                (None, Some(link)) => {
                    let link_id = LinkId::from_hex(link)
                        .map_err(|_| invalid_params("invalid link id"))?;
                    let identity = match &display_name {
                        Some(name) => SubscriberIdentity::Anonymous { display_name: name.clone() },
                        None => SubscriberIdentity::Link(link_id),
                    };
                    (Principal::Link(link_id), identity)
                }
                (None, None) => return Err(veil_err(&VeilError::NotAuthenticated)),
            };
            // Connect-time auth decision, fed by membership state.
            self.state
                .roster
                .require_active_member(&conversation_id, &principal)
                .map_err(|e| veil_err(&e))?;
            Ok((conversation_id, identity))
        })();

        let (conversation_id, identity) = match setup {
            Ok(ok) => ok,
            Err(e) => {
                pending.reject(e).await;
                return Ok(());
            }
        };

        let hub = self.state.hubs.hub(conversation_id);
        let (subscriber_id, mut events) = hub.subscribe(identity);
        let sink = match pending.accept().await {
            Ok(s) => s,
            Err(_) => {
                hub.unsubscribe(subscriber_id);
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        let msg = SubscriptionMessage::from_json(&event)
                            .map_err(|e| e.to_string())?;
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sink.closed() => break,
            }
        }
        hub.unsubscribe(subscriber_id);
        Ok(())
    }
}

// ── Request assembly helpers ─────────────────────────────────────────────────

impl RpcServer {
    /// Resolve the sending principal: session token for account members,
    /// link id (rate-limited per client IP) for guests.
    fn sender_for(
        &self,
        session_token: Option<&str>,
        link_id: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<SendPrincipal, ErrorObject<'static>> {
        match (session_token, link_id) {
            (Some(token), _) => Ok(SendPrincipal::Account(self.state.resolve_session(token)?)),
            (None, Some(link)) => {
                let link_id =
                    LinkId::from_hex(link).map_err(|_| invalid_params("invalid link id"))?;
                let rate_key = client_ip.map(str::to_string).unwrap_or_else(|| link_id.to_hex());
                self.state
                    .guest_send_limiter
                    .check(&rate_key, self.state.clock.now())
                    .map_err(|e| veil_err(&e))?;
                Ok(SendPrincipal::LinkGuest(link_id))
            }
            (None, None) => Err(veil_err(&VeilError::NotAuthenticated)),
        }
    }

    fn build_send_request(&self, req: &RpcSendMessage) -> Result<SendRequest, ErrorObject<'static>> {
        let conversation_id = ConversationId::from_hex(&req.conversation_id)
            .map_err(|_| invalid_params("invalid conversation id"))?;
        let message_id = MessageId::from_hex(&req.message_id)
            .map_err(|_| invalid_params("invalid message id"))?;
        let sender = self.sender_for(
            req.session_token.as_deref(),
            req.link_id.as_deref(),
            req.client_ip.as_deref(),
        )?;
        let mut context = Vec::with_capacity(req.messages_for_inference.len());
        for turn in &req.messages_for_inference {
            context.push(ChatTurn {
                role: parse_role(&turn.role)?,
                content: turn.content.clone(),
            });
        }
        Ok(SendRequest {
            conversation_id,
            sender,
            sender_display_name: req.display_name.clone(),
            model: req.model.clone(),
            message_id,
            content: req.content.clone(),
            context,
            declared_funding: parse_funding(&req.funding_source)?,
        })
    }
}
