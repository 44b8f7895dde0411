//! The streaming chat pipeline: speculative reserve → stream tokens → atomic
//! commit of the user+AI pair with billing → release, with fan-out to the
//! conversation hub at every stage.
//!
//! Failure discipline: anything that goes wrong before the `start` event is
//! returned as an error (HTTP status + envelope); anything after is reported
//! on the stream and the hub, and nothing is persisted or charged. Once the
//! stream has produced a complete response, the commit runs to completion
//! whether or not the originating client is still connected: the RPC layer
//! drives this pipeline from a detached task, and the commit path itself
//! never awaits client I/O.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use veil_billing::{
    budget_key_account, check_funding_agreement, cost_from_usage, estimate_from_chars,
    estimate_from_tokens, pessimistic_max_cost, record_covered_spend, resolve_payer, PayerDecision,
    PayerKind, PricingTable, ReservationScope, ReservationStore, ReservationTicket, SendPrincipal,
    TokenUsage,
};
use veil_billing::reserve::{conversation_key, member_key, payer_key};
use veil_broadcast::{ChatEvent, ConversationHub, HubRegistry};
use veil_core::constants::{
    DEFAULT_FREE_ALLOWANCE, DEFAULT_LLM_STREAM_TIMEOUT_SECS, DEFAULT_MAX_NEGATIVE_BALANCE,
    ESTIMATED_CHARS_PER_TOKEN, MAX_CONTEXT_MESSAGES, MAX_MESSAGE_BYTES, STREAM_BATCH_INTERVAL_MS,
};
use veil_core::conversation::Epoch;
use veil_core::message::{LlmCompletion, Message, SharedMessage, UsageRecord, UsageStatus};
use veil_core::types::{
    credits_to_dollars, AccountId, ConversationId, Credits, FundingSource, MessageId, Principal,
    SenderType, ShareId, UsageId,
};
use veil_core::{Clock, VeilError};
use veil_crypto::seal_message;
use veil_epoch::rotation_required_error;
use veil_roster::RosterService;
use veil_store::{KeyedLocks, SequencePair, StoreDb};
use veil_wallet::{debit_for_usage, funding_wallet_kind, spendable_balance};

use crate::llm::{ChatTurn, CompletionRequest, LlmStreamer, Role};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub free_allowance: Credits,
    /// Negative value: the floor an owner's purchased wallet may reach while
    /// covering group spend.
    pub negative_floor: Credits,
    /// Dev/test billing: estimate costs from character counts when the
    /// provider returns no usage data.
    pub dev_billing: bool,
    pub token_batch_interval: Duration,
    pub stream_timeout: Duration,
    /// Provider label recorded on completion rows.
    pub provider: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            free_allowance: DEFAULT_FREE_ALLOWANCE,
            negative_floor: DEFAULT_MAX_NEGATIVE_BALANCE,
            dev_billing: false,
            token_batch_interval: Duration::from_millis(STREAM_BATCH_INTERVAL_MS),
            stream_timeout: Duration::from_secs(DEFAULT_LLM_STREAM_TIMEOUT_SECS),
            provider: "openai".to_string(),
        }
    }
}

// ── Requests / events ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub sender: SendPrincipal,
    /// Captured display name for anonymous link guests.
    pub sender_display_name: Option<String>,
    pub model: String,
    /// Client-chosen id for the user message.
    pub message_id: MessageId,
    pub content: String,
    pub context: Vec<ChatTurn>,
    pub declared_funding: FundingSource,
}

/// Per-request stream events (the SSE surface), distinct from the hub's
/// conversation-wide fan-out.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { assistant_message_id: String },
    Token { text: String },
    #[serde(rename_all = "camelCase")]
    Done {
        user_message_id: String,
        assistant_message_id: String,
        user_sequence: u64,
        ai_sequence: u64,
        epoch_number: u64,
        cost: String,
    },
    Error { code: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostedMessage {
    pub sequence_number: u64,
    pub epoch_number: u64,
}

struct Prepared {
    decision: PayerDecision,
    ticket: ReservationTicket,
    seq: SequencePair,
    epoch: Epoch,
    prompt_chars: usize,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct StreamPipeline {
    db: Arc<StoreDb>,
    hubs: Arc<HubRegistry>,
    roster: Arc<RosterService>,
    llm: Arc<dyn LlmStreamer>,
    reservations: Arc<dyn ReservationStore>,
    pricing: Arc<PricingTable>,
    wallet_locks: Arc<KeyedLocks<AccountId>>,
    clock: Arc<dyn Clock>,
    config: StreamConfig,
}

impl StreamPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<StoreDb>,
        hubs: Arc<HubRegistry>,
        roster: Arc<RosterService>,
        llm: Arc<dyn LlmStreamer>,
        reservations: Arc<dyn ReservationStore>,
        pricing: Arc<PricingTable>,
        wallet_locks: Arc<KeyedLocks<AccountId>>,
        clock: Arc<dyn Clock>,
        config: StreamConfig,
    ) -> Self {
        Self {
            db,
            hubs,
            roster,
            llm,
            reservations,
            pricing,
            wallet_locks,
            clock,
            config,
        }
    }

    // ── Full send (user message + AI reply) ──────────────────────────────────

    /// Run the whole send protocol. Errors before the stream starts come back
    /// as `Err`; after that, failures surface as `error` events (and a hub
    /// `message:error`) with nothing persisted, and the call returns `Ok`.
    pub async fn send_message(
        &self,
        request: SendRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<(), VeilError> {
        let prepared = self.prepare(&request)?;
        let hub = self.hubs.hub(request.conversation_id);

        // Plaintext preview for synchronous UI; never persisted.
        let ai_message_id = MessageId::random();
        hub.publish(ChatEvent::MessageNew {
            conversation_id: request.conversation_id.to_hex(),
            message_id: request.message_id.to_hex(),
            sender_type: SenderType::User.as_str().to_string(),
            sender_id: request.sender.account_id().map(|a| a.to_b58()),
            sender_display_name: request.sender_display_name.clone(),
            content: Some(request.content.clone()),
        });
        let _ = events
            .send(StreamEvent::Start { assistant_message_id: ai_message_id.to_hex() })
            .await;

        let streamed = self
            .consume_stream(&request, &ai_message_id, &hub, &events)
            .await;
        let result = match streamed {
            Ok((response, usage)) => {
                self.commit(&prepared, &request, ai_message_id, &response, usage, &hub, &events)
                    .await
            }
            Err(e) => Err(e),
        };
        self.reservations.release(&prepared.ticket);

        if let Err(e) = result {
            warn!(
                conversation = %request.conversation_id,
                code = e.code(),
                error = %e,
                "send aborted after stream start"
            );
            hub.publish(ChatEvent::MessageError {
                conversation_id: request.conversation_id.to_hex(),
                message_id: request.message_id.to_hex(),
                code: e.code().to_string(),
                message: e.to_string(),
            });
            let _ = events
                .send(StreamEvent::Error { code: e.code().to_string(), message: e.to_string() })
                .await;
        }
        Ok(())
    }

    /// Everything that must pass before the stream may start: membership and
    /// privilege, context shape, payer resolution, funding agreement,
    /// reservation, the lazy-rotation gate, and the sequence-pair claim.
    fn prepare(&self, request: &SendRequest) -> Result<Prepared, VeilError> {
        let now = self.clock.now();
        let (conv, member) = self
            .roster
            .require_active_member(&request.conversation_id, &request.sender.principal())?;
        if !member.privilege.can_send() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        if request.content.len() > MAX_MESSAGE_BYTES {
            return Err(VeilError::MessageTooLarge { max: MAX_MESSAGE_BYTES });
        }
        if request.context.len() > MAX_CONTEXT_MESSAGES {
            return Err(VeilError::MessageTooLarge { max: MAX_CONTEXT_MESSAGES });
        }
        match request.context.last() {
            Some(turn) if turn.role == Role::User => {}
            _ => return Err(VeilError::LastMessageNotUser),
        }

        let prompt_chars: usize = request.context.iter().map(|t| t.content.len()).sum();
        let max_cost = pessimistic_max_cost(&self.pricing, &request.model, prompt_chars);
        let decision = resolve_payer(
            &self.db,
            &conv,
            &request.sender,
            max_cost,
            self.config.free_allowance,
            self.config.negative_floor,
            now,
        )?;
        check_funding_agreement(&decision, request.declared_funding)?;

        // Hold the pessimistic cost against every cap this send could blow:
        // payer balance always, member + conversation budgets when the owner
        // is covering.
        let payer_balance = spendable_balance(&self.db, &decision.payer)?;
        let mut scopes = vec![ReservationScope {
            key: payer_key(&decision.payer),
            cap: payer_balance - decision.negative_floor.unwrap_or(0),
            used: 0,
        }];
        if decision.kind == PayerKind::OwnerCovers {
            let budget_account = budget_key_account(&request.sender);
            let row = self.db.get_member_budget(&request.conversation_id, &budget_account)?;
            let budget = conv
                .per_person_budget
                .or(row.as_ref().map(|b| b.budget))
                .unwrap_or(0);
            let spent = row.map(|b| b.spent).unwrap_or(0);
            scopes.push(ReservationScope {
                key: member_key(&request.conversation_id, &request.sender.principal()),
                cap: budget,
                used: spent,
            });
            if let Some(cap) = conv.conversation_budget {
                let total = self
                    .db
                    .get_spending(&request.conversation_id)?
                    .map(|s| s.total_spent)
                    .unwrap_or(0);
                scopes.push(ReservationScope {
                    key: conversation_key(&request.conversation_id),
                    cap,
                    used: total,
                });
            }
        }
        let ticket = self.reservations.try_reserve(&scopes, max_cost, now)?;

        match self.claim_sequences(request, conv.rotation_pending, conv.current_epoch) {
            Ok((seq, epoch)) => Ok(Prepared { decision, ticket, seq, epoch, prompt_chars }),
            Err(e) => {
                self.reservations.release(&ticket);
                Err(e)
            }
        }
    }

    fn claim_sequences(
        &self,
        request: &SendRequest,
        rotation_pending: bool,
        current_epoch: u64,
    ) -> Result<(SequencePair, Epoch), VeilError> {
        if rotation_pending {
            return Err(rotation_required_error(
                &self.db,
                &request.conversation_id,
                current_epoch,
            ));
        }
        let seq = self.db.allocate_sequence_pair(&request.conversation_id)?;
        let epoch = self
            .db
            .get_epoch(&request.conversation_id, seq.epoch_number)?
            .ok_or_else(|| {
                VeilError::Internal(format!("epoch {} row missing", seq.epoch_number))
            })?;
        Ok((seq, epoch))
    }

    /// Read the provider stream, batching token fan-out to roughly one
    /// `message:stream` per batch interval.
    async fn consume_stream(
        &self,
        request: &SendRequest,
        ai_message_id: &MessageId,
        hub: &ConversationHub,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<(String, Option<TokenUsage>), VeilError> {
        let mut stream = self.llm.start(CompletionRequest {
            model: request.model.clone(),
            context: request.context.clone(),
        });

        let mut response = String::new();
        let mut batch = String::new();
        let mut last_emit = Instant::now();

        loop {
            match tokio::time::timeout(self.config.stream_timeout, stream.tokens.recv()).await {
                Err(_) => return Err(VeilError::StreamTimeout),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(token))) => {
                    response.push_str(&token);
                    batch.push_str(&token);
                    if last_emit.elapsed() >= self.config.token_batch_interval {
                        self.emit_tokens(request, ai_message_id, hub, events, &mut batch).await;
                        last_emit = Instant::now();
                    }
                }
            }
        }
        self.emit_tokens(request, ai_message_id, hub, events, &mut batch).await;

        let usage = stream.usage.await.unwrap_or(None);
        Ok((response, usage))
    }

    async fn emit_tokens(
        &self,
        request: &SendRequest,
        ai_message_id: &MessageId,
        hub: &ConversationHub,
        events: &mpsc::Sender<StreamEvent>,
        batch: &mut String,
    ) {
        if batch.is_empty() {
            return;
        }
        hub.publish(ChatEvent::MessageStream {
            conversation_id: request.conversation_id.to_hex(),
            message_id: ai_message_id.to_hex(),
            tokens: batch.clone(),
        });
        let _ = events.send(StreamEvent::Token { text: batch.clone() }).await;
        batch.clear();
    }

    /// The atomic commit: both messages, the billing artifacts, the debit,
    /// and the budget bookkeeping land together under the payer's wallet
    /// lock, or none of them do.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        prepared: &Prepared,
        request: &SendRequest,
        ai_message_id: MessageId,
        response: &str,
        usage: Option<TokenUsage>,
        hub: &ConversationHub,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), VeilError> {
        let cost = match &usage {
            Some(u) => cost_from_usage(&self.pricing, &request.model, u),
            None if self.config.dev_billing => {
                estimate_from_chars(&self.pricing, &request.model, prepared.prompt_chars, response.len())
            }
            None => estimate_from_tokens(
                &self.pricing,
                &request.model,
                prepared.prompt_chars as u64 / ESTIMATED_CHARS_PER_TOKEN,
                response.len() as u64 / ESTIMATED_CHARS_PER_TOKEN,
            ),
        };

        let user_blob = seal_message(&prepared.epoch.public_key, request.content.as_bytes())?;
        let ai_blob = seal_message(&prepared.epoch.public_key, response.as_bytes())?;

        let _wallet_guard = self.wallet_locks.acquire(prepared.decision.payer).await;
        let now = self.clock.now();

        // A rotation that landed after our sequence claim retired the key
        // these blobs target.
        let conv = self
            .db
            .get_conversation(&request.conversation_id)?
            .ok_or(VeilError::ConversationNotFound)?;
        if conv.current_epoch != prepared.seq.epoch_number {
            return Err(VeilError::StaleEpoch {
                submitted: prepared.seq.epoch_number,
                current: conv.current_epoch,
            });
        }

        // Debit feasibility under the wallet lock, before the first row
        // lands; past this point every write must succeed.
        if funding_wallet_kind(&self.db, &prepared.decision.payer, cost, prepared.decision.negative_floor)?
            .is_none()
        {
            return Err(VeilError::PremiumRequiresBalance {
                current_balance: spendable_balance(&self.db, &prepared.decision.payer)?,
            });
        }

        let usage_id = UsageId::random();
        self.db.insert_message(&Message {
            message_id: request.message_id,
            conversation_id: request.conversation_id,
            epoch_number: prepared.seq.epoch_number,
            sequence_number: prepared.seq.user_seq,
            sender_type: SenderType::User,
            sender_account: request.sender.account_id(),
            sender_display_name: request.sender_display_name.clone(),
            payer_account: None,
            cost: 0,
            blob: user_blob.clone(),
            created_at: now,
        })?;
        self.db.insert_message(&Message {
            message_id: ai_message_id,
            conversation_id: request.conversation_id,
            epoch_number: prepared.seq.epoch_number,
            sequence_number: prepared.seq.ai_seq,
            sender_type: SenderType::Ai,
            sender_account: None,
            sender_display_name: None,
            payer_account: Some(prepared.decision.payer),
            cost,
            blob: ai_blob.clone(),
            created_at: now,
        })?;

        let mut usage_record = UsageRecord {
            usage_id,
            account_id: Some(prepared.decision.payer),
            conversation_id: request.conversation_id,
            message_id: ai_message_id,
            status: UsageStatus::Pending,
            total_cost: cost,
            created_at: now,
        };
        self.db.put_usage(&usage_record)?;
        let tokens = usage.unwrap_or(TokenUsage {
            input_tokens: prepared.prompt_chars as u64 / ESTIMATED_CHARS_PER_TOKEN,
            output_tokens: response.len() as u64 / ESTIMATED_CHARS_PER_TOKEN,
            cached_tokens: 0,
        });
        self.db.put_completion(&LlmCompletion {
            usage_id,
            model: request.model.clone(),
            provider: self.config.provider.clone(),
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            cached_tokens: tokens.cached_tokens,
        })?;

        debit_for_usage(
            &self.db,
            &prepared.decision.payer,
            cost,
            usage_id,
            prepared.decision.negative_floor,
            now,
        )?;
        if prepared.decision.kind == PayerKind::OwnerCovers {
            record_covered_spend(&self.db, &request.conversation_id, &request.sender, cost)?;
        }
        usage_record.status = UsageStatus::Completed;
        self.db.put_usage(&usage_record)?;
        self.db.flush()?;

        info!(
            conversation = %request.conversation_id,
            user_seq = prepared.seq.user_seq,
            ai_seq = prepared.seq.ai_seq,
            epoch = prepared.seq.epoch_number,
            payer = %prepared.decision.payer,
            cost = %credits_to_dollars(cost),
            "message pair committed"
        );

        hub.publish(ChatEvent::MessageComplete {
            conversation_id: request.conversation_id.to_hex(),
            user_message_id: request.message_id.to_hex(),
            ai_message_id: ai_message_id.to_hex(),
            epoch_number: prepared.seq.epoch_number,
            user_sequence: prepared.seq.user_seq,
            ai_sequence: prepared.seq.ai_seq,
            payer_id: Some(prepared.decision.payer.to_b58()),
            cost: credits_to_dollars(cost),
            user_blob: hex::encode(&user_blob),
            ai_blob: hex::encode(&ai_blob),
        });
        let _ = events
            .send(StreamEvent::Done {
                user_message_id: request.message_id.to_hex(),
                assistant_message_id: ai_message_id.to_hex(),
                user_sequence: prepared.seq.user_seq,
                ai_sequence: prepared.seq.ai_seq,
                epoch_number: prepared.seq.epoch_number,
                cost: credits_to_dollars(cost),
            })
            .await;
        Ok(())
    }

    // ── User-only send (no AI reply) ─────────────────────────────────────────

    /// Persist a single user message: one sequence number, one insert, and a
    /// `message:new` broadcast that deliberately omits the plaintext.
    pub async fn post_message(
        &self,
        conversation_id: ConversationId,
        sender: SendPrincipal,
        sender_display_name: Option<String>,
        message_id: MessageId,
        content: String,
    ) -> Result<PostedMessage, VeilError> {
        let now = self.clock.now();
        let (conv, member) =
            self.roster.require_active_member(&conversation_id, &sender.principal())?;
        if !member.privilege.can_send() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        if content.len() > MAX_MESSAGE_BYTES {
            return Err(VeilError::MessageTooLarge { max: MAX_MESSAGE_BYTES });
        }
        if conv.rotation_pending {
            return Err(rotation_required_error(&self.db, &conversation_id, conv.current_epoch));
        }

        let (sequence_number, epoch_number) = self.db.allocate_sequence_one(&conversation_id)?;
        let epoch = self
            .db
            .get_epoch(&conversation_id, epoch_number)?
            .ok_or_else(|| VeilError::Internal(format!("epoch {epoch_number} row missing")))?;
        let blob = seal_message(&epoch.public_key, content.as_bytes())?;

        // Rotation racing this insert retires the epoch we encrypted for.
        let check = self
            .db
            .get_conversation(&conversation_id)?
            .ok_or(VeilError::ConversationNotFound)?;
        if check.current_epoch != epoch_number {
            return Err(VeilError::StaleEpoch {
                submitted: epoch_number,
                current: check.current_epoch,
            });
        }

        self.db.insert_message(&Message {
            message_id,
            conversation_id,
            epoch_number,
            sequence_number,
            sender_type: SenderType::User,
            sender_account: sender.account_id(),
            sender_display_name: sender_display_name.clone(),
            payer_account: None,
            cost: 0,
            blob,
            created_at: now,
        })?;
        self.db.flush()?;

        self.hubs.hub(conversation_id).publish(ChatEvent::MessageNew {
            conversation_id: conversation_id.to_hex(),
            message_id: message_id.to_hex(),
            sender_type: SenderType::User.as_str().to_string(),
            sender_id: sender.account_id().map(|a| a.to_b58()),
            sender_display_name,
            content: None,
        });
        Ok(PostedMessage { sequence_number, epoch_number })
    }

    // ── Deletion / history ───────────────────────────────────────────────────

    /// Hard delete. Authors may delete their own messages; admins anything.
    pub fn delete_message(
        &self,
        conversation_id: ConversationId,
        actor: &SendPrincipal,
        message_id: MessageId,
    ) -> Result<(), VeilError> {
        let (_, member) =
            self.roster.require_active_member(&conversation_id, &actor.principal())?;
        let message = self
            .db
            .get_message(&message_id)?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(VeilError::MessageNotFound)?;

        let is_author =
            actor.account_id().is_some() && message.sender_account == actor.account_id();
        if !is_author && !member.privilege.can_remove_members() {
            return Err(VeilError::PrivilegeInsufficient);
        }

        self.db.delete_message(&message_id)?;
        self.hubs.hub(conversation_id).publish(ChatEvent::MessageDeleted {
            conversation_id: conversation_id.to_hex(),
            message_id: message_id.to_hex(),
        });
        Ok(())
    }

    /// History fetch with the server-enforced visibility floor.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        principal: &Principal,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Message>, VeilError> {
        let (_, member) = self.roster.require_active_member(&conversation_id, principal)?;
        Ok(self
            .db
            .messages_from(&conversation_id, from_sequence, limit)?
            .into_iter()
            .filter(|m| m.epoch_number >= member.visible_from_epoch)
            .collect())
    }

    // ── Shared messages ──────────────────────────────────────────────────────

    /// Store an out-of-band share blob (client-encrypted under a standalone
    /// share secret, unrelated to any epoch key).
    pub fn share_message(&self, blob: Vec<u8>) -> Result<ShareId, VeilError> {
        let share = SharedMessage {
            share_id: ShareId::random(),
            blob,
            created_at: self.clock.now(),
        };
        self.db.put_shared_message(&share)?;
        Ok(share.share_id)
    }

    pub fn get_shared_message(&self, share_id: &ShareId) -> Result<SharedMessage, VeilError> {
        self.db
            .get_shared_message(share_id)?
            .ok_or(VeilError::MessageNotFound)
    }
}
