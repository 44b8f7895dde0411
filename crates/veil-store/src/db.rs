use std::path::Path;

use veil_core::account::{Account, LedgerCause, LedgerEntry, Payment, Wallet};
use veil_core::conversation::{
    Conversation, ConversationMember, ConversationSpending, Epoch, EpochMemberWrap, MemberBudget,
    PendingRemoval, SharedLink,
};
use veil_core::message::{LlmCompletion, Message, SharedMessage, UsageRecord};
use veil_core::types::{
    AccountId, ConversationId, EpochNumber, LinkId, MessageId, Principal, PublicKeyBytes,
    SequenceNumber, ShareId, Timestamp, UsageId, WalletId,
};
use veil_core::VeilError;

/// Persistent store backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   accounts          — AccountId bytes                     → bincode(Account)
///   account_emails    — email utf8                          → AccountId bytes
///   account_usernames — username utf8                       → AccountId bytes
///   wallets           — WalletId bytes                      → bincode(Wallet)
///   wallet_owners     — AccountId ‖ WalletId                → [] (membership)
///   ledger            — WalletId ‖ index be64               → bincode(LedgerEntry)
///   payments          — payment id utf8                     → bincode(Payment)
///   conversations     — ConversationId bytes                → bincode(Conversation)
///   epochs            — ConversationId ‖ epoch be64         → bincode(Epoch)
///   epoch_wraps       — ConversationId ‖ epoch be64 ‖ pk    → bincode(EpochMemberWrap)
///   members           — ConversationId ‖ principal (33B)    → bincode(ConversationMember)
///   links             — LinkId bytes                        → bincode(SharedLink)
///   conversation_links— ConversationId ‖ LinkId             → [] (membership)
///   member_budgets    — ConversationId ‖ AccountId          → bincode(MemberBudget)
///   spending          — ConversationId bytes                → bincode(ConversationSpending)
///   pending_removals  — ConversationId ‖ principal (33B)    → bincode(PendingRemoval)
///   messages          — ConversationId ‖ sequence be64      → bincode(Message)
///   message_index     — MessageId bytes                     → ConversationId ‖ sequence be64
///   usage_records     — UsageId bytes                       → bincode(UsageRecord)
///   completions       — UsageId bytes                       → bincode(LlmCompletion)
///   shared_messages   — ShareId bytes                       → bincode(SharedMessage)
pub struct StoreDb {
    _db: sled::Db,
    accounts: sled::Tree,
    account_emails: sled::Tree,
    account_usernames: sled::Tree,
    wallets: sled::Tree,
    wallet_owners: sled::Tree,
    ledger: sled::Tree,
    payments: sled::Tree,
    conversations: sled::Tree,
    epochs: sled::Tree,
    epoch_wraps: sled::Tree,
    members: sled::Tree,
    links: sled::Tree,
    conversation_links: sled::Tree,
    member_budgets: sled::Tree,
    spending: sled::Tree,
    pending_removals: sled::Tree,
    messages: sled::Tree,
    message_index: sled::Tree,
    usage_records: sled::Tree,
    completions: sled::Tree,
    shared_messages: sled::Tree,
}

/// Result of reserving two consecutive sequence numbers for a user+AI pair.
/// `epoch_number` is the conversation's current epoch at reservation time;
/// the commit re-checks it and fails `stale-epoch` if a rotation landed in
/// between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequencePair {
    pub user_seq: SequenceNumber,
    pub ai_seq: SequenceNumber,
    pub epoch_number: EpochNumber,
}

fn storage_err(e: sled::Error) -> VeilError {
    VeilError::Storage(e.to_string())
}

fn ser<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, VeilError> {
    bincode::serialize(value).map_err(|e| VeilError::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, VeilError> {
    bincode::deserialize(bytes).map_err(|e| VeilError::Serialization(e.to_string()))
}

// ── Key builders ─────────────────────────────────────────────────────────────

fn pair_key(a: &[u8; 32], b: &[u8; 32]) -> [u8; 64] {
    let mut k = [0u8; 64];
    k[..32].copy_from_slice(a);
    k[32..].copy_from_slice(b);
    k
}

fn seq_key(conv: &ConversationId, n: u64) -> [u8; 40] {
    let mut k = [0u8; 40];
    k[..32].copy_from_slice(conv.as_bytes());
    k[32..].copy_from_slice(&n.to_be_bytes());
    k
}

fn principal_key(conv: &ConversationId, principal: &Principal) -> [u8; 65] {
    let mut k = [0u8; 65];
    k[..32].copy_from_slice(conv.as_bytes());
    k[32..].copy_from_slice(&principal.key_bytes());
    k
}

fn wrap_key(conv: &ConversationId, epoch: EpochNumber, member_pk: &PublicKeyBytes) -> [u8; 72] {
    let mut k = [0u8; 72];
    k[..32].copy_from_slice(conv.as_bytes());
    k[32..40].copy_from_slice(&epoch.to_be_bytes());
    k[40..].copy_from_slice(member_pk);
    k
}

fn wrap_prefix(conv: &ConversationId, epoch: EpochNumber) -> [u8; 40] {
    let mut k = [0u8; 40];
    k[..32].copy_from_slice(conv.as_bytes());
    k[32..].copy_from_slice(&epoch.to_be_bytes());
    k
}

impl StoreDb {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VeilError> {
        let db = sled::open(path).map_err(storage_err)?;
        let tree = |name: &str| db.open_tree(name).map_err(storage_err);
        Ok(Self {
            accounts: tree("accounts")?,
            account_emails: tree("account_emails")?,
            account_usernames: tree("account_usernames")?,
            wallets: tree("wallets")?,
            wallet_owners: tree("wallet_owners")?,
            ledger: tree("ledger")?,
            payments: tree("payments")?,
            conversations: tree("conversations")?,
            epochs: tree("epochs")?,
            epoch_wraps: tree("epoch_wraps")?,
            members: tree("members")?,
            links: tree("links")?,
            conversation_links: tree("conversation_links")?,
            member_budgets: tree("member_budgets")?,
            spending: tree("spending")?,
            pending_removals: tree("pending_removals")?,
            messages: tree("messages")?,
            message_index: tree("message_index")?,
            usage_records: tree("usage_records")?,
            completions: tree("completions")?,
            shared_messages: tree("shared_messages")?,
            _db: db,
        })
    }

    /// Open a throwaway store in a fresh temp directory (tests).
    pub fn open_temp(name: &str) -> Result<Self, VeilError> {
        let dir = std::env::temp_dir().join(format!("veil_store_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Self::open(dir)
    }

    pub fn flush(&self) -> Result<(), VeilError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>, VeilError> {
        match self.accounts.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_account(&self, account: &Account) -> Result<(), VeilError> {
        self.accounts
            .insert(account.account_id.as_bytes(), ser(account)?)
            .map_err(storage_err)?;
        self.account_emails
            .insert(account.email.as_bytes(), account.account_id.as_bytes().as_ref())
            .map_err(storage_err)?;
        self.account_usernames
            .insert(account.username.as_bytes(), account.account_id.as_bytes().as_ref())
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn account_id_by_email(&self, email: &str) -> Result<Option<AccountId>, VeilError> {
        match self.account_emails.get(email.as_bytes()).map_err(storage_err)? {
            Some(bytes) => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Some(AccountId::from_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn account_id_by_username(&self, username: &str) -> Result<Option<AccountId>, VeilError> {
        match self.account_usernames.get(username.as_bytes()).map_err(storage_err)? {
            Some(bytes) => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Some(AccountId::from_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Remove the account row and its uniqueness indexes. Wallets, ledger
    /// entries, usage records, and payments are left in place with their
    /// account reference nulled by the caller.
    pub fn delete_account_row(&self, id: &AccountId) -> Result<(), VeilError> {
        if let Some(account) = self.get_account(id)? {
            self.account_emails
                .remove(account.email.as_bytes())
                .map_err(storage_err)?;
            self.account_usernames
                .remove(account.username.as_bytes())
                .map_err(storage_err)?;
            self.accounts.remove(id.as_bytes()).map_err(storage_err)?;
        }
        Ok(())
    }

    // ── Wallets ──────────────────────────────────────────────────────────────

    pub fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>, VeilError> {
        match self.wallets.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_wallet(&self, wallet: &Wallet) -> Result<(), VeilError> {
        self.wallets
            .insert(wallet.wallet_id.as_bytes(), ser(wallet)?)
            .map_err(storage_err)?;
        if let Some(owner) = &wallet.owner {
            self.wallet_owners
                .insert(pair_key(owner.as_bytes(), wallet.wallet_id.as_bytes()), b"".as_ref())
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// All wallets owned by `account`, ascending priority (debit order).
    pub fn wallets_for_account(&self, account: &AccountId) -> Result<Vec<Wallet>, VeilError> {
        let mut out = Vec::new();
        for item in self.wallet_owners.scan_prefix(account.as_bytes()) {
            let (key, _) = item.map_err(storage_err)?;
            let mut wallet_id = [0u8; 32];
            wallet_id.copy_from_slice(&key[32..]);
            if let Some(w) = self.get_wallet(&WalletId::from_bytes(wallet_id))? {
                out.push(w);
            }
        }
        out.sort_by_key(|w| w.priority);
        Ok(out)
    }

    /// Null the owner reference, preserving the wallet and its ledger.
    pub fn detach_wallet_owner(&self, wallet_id: &WalletId) -> Result<(), VeilError> {
        let Some(mut wallet) = self.get_wallet(wallet_id)? else {
            return Ok(());
        };
        if let Some(owner) = wallet.owner.take() {
            self.wallet_owners
                .remove(pair_key(owner.as_bytes(), wallet_id.as_bytes()))
                .map_err(storage_err)?;
            self.wallets
                .insert(wallet_id.as_bytes(), ser(&wallet)?)
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ── Ledger ───────────────────────────────────────────────────────────────

    /// Append one entry at its fixed index. The caller owns index assignment
    /// (the wallet's `ledger_seq`) and must hold the account's wallet lock.
    pub fn append_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), VeilError> {
        let mut key = [0u8; 40];
        key[..32].copy_from_slice(entry.wallet_id.as_bytes());
        key[32..].copy_from_slice(&entry.index.to_be_bytes());
        self.ledger.insert(key, ser(entry)?).map_err(storage_err)?;
        Ok(())
    }

    /// All entries for a wallet in append order.
    pub fn ledger_for_wallet(&self, wallet_id: &WalletId) -> Result<Vec<LedgerEntry>, VeilError> {
        let mut out = Vec::new();
        for item in self.ledger.scan_prefix(wallet_id.as_bytes()) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    /// Timestamp of the most recent `renewal` entry for a wallet, scanning
    /// newest-first.
    pub fn last_renewal_at(&self, wallet_id: &WalletId) -> Result<Option<Timestamp>, VeilError> {
        for item in self.ledger.scan_prefix(wallet_id.as_bytes()).rev() {
            let (_, bytes) = item.map_err(storage_err)?;
            let entry: LedgerEntry = de(&bytes)?;
            if matches!(entry.cause, LedgerCause::Renewal { .. }) {
                return Ok(Some(entry.created_at));
            }
        }
        Ok(None)
    }

    // ── Payments ─────────────────────────────────────────────────────────────

    pub fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, VeilError> {
        match self.payments.get(payment_id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_payment(&self, payment: &Payment) -> Result<(), VeilError> {
        self.payments
            .insert(payment.payment_id.as_bytes(), ser(payment)?)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────────────────

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, VeilError> {
        match self.conversations.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_conversation(&self, conversation: &Conversation) -> Result<(), VeilError> {
        self.conversations
            .insert(conversation.conversation_id.as_bytes(), ser(conversation)?)
            .map_err(storage_err)?;
        Ok(())
    }

    /// Atomically read-modify-write the conversation row (CAS loop).
    pub fn update_conversation<F>(
        &self,
        id: &ConversationId,
        mut apply: F,
    ) -> Result<Conversation, VeilError>
    where
        F: FnMut(&mut Conversation),
    {
        loop {
            let current = self
                .conversations
                .get(id.as_bytes())
                .map_err(storage_err)?
                .ok_or(VeilError::ConversationNotFound)?;
            let mut conv: Conversation = de(&current)?;
            apply(&mut conv);
            let updated = ser(&conv)?;
            match self
                .conversations
                .compare_and_swap(id.as_bytes(), Some(current), Some(updated))
                .map_err(storage_err)?
            {
                Ok(()) => return Ok(conv),
                Err(_) => continue,
            }
        }
    }

    /// Reserve two consecutive sequence numbers (user, AI) in one atomic
    /// update. This is the ordering commitment: aborted sends waste their
    /// pair, monotonicity is what matters.
    pub fn allocate_sequence_pair(&self, id: &ConversationId) -> Result<SequencePair, VeilError> {
        let conv = self.update_conversation(id, |c| c.next_sequence += 2)?;
        Ok(SequencePair {
            user_seq: conv.next_sequence - 2,
            ai_seq: conv.next_sequence - 1,
            epoch_number: conv.current_epoch,
        })
    }

    /// Reserve a single sequence number (user-only sends).
    pub fn allocate_sequence_one(
        &self,
        id: &ConversationId,
    ) -> Result<(SequenceNumber, EpochNumber), VeilError> {
        let conv = self.update_conversation(id, |c| c.next_sequence += 1)?;
        Ok((conv.next_sequence - 1, conv.current_epoch))
    }

    /// Delete a conversation and every dependent row. Usage records and
    /// ledger entries survive (they are financial audit data referenced from
    /// wallets, not conversation-owned state).
    pub fn delete_conversation_cascade(&self, id: &ConversationId) -> Result<(), VeilError> {
        // Messages and their id index.
        for item in self.messages.scan_prefix(id.as_bytes()) {
            let (key, bytes) = item.map_err(storage_err)?;
            let msg: Message = de(&bytes)?;
            self.message_index
                .remove(msg.message_id.as_bytes())
                .map_err(storage_err)?;
            self.messages.remove(key).map_err(storage_err)?;
        }
        // Links (shared tree keyed by link id, plus the membership index).
        for item in self.conversation_links.scan_prefix(id.as_bytes()) {
            let (key, _) = item.map_err(storage_err)?;
            let mut link_id = [0u8; 32];
            link_id.copy_from_slice(&key[32..]);
            self.links.remove(link_id).map_err(storage_err)?;
            self.conversation_links.remove(key).map_err(storage_err)?;
        }
        for tree in [
            &self.epochs,
            &self.epoch_wraps,
            &self.members,
            &self.member_budgets,
            &self.pending_removals,
        ] {
            let keys: Vec<_> = tree
                .scan_prefix(id.as_bytes())
                .keys()
                .collect::<Result<_, _>>()
                .map_err(storage_err)?;
            for key in keys {
                tree.remove(key).map_err(storage_err)?;
            }
        }
        self.spending.remove(id.as_bytes()).map_err(storage_err)?;
        self.conversations.remove(id.as_bytes()).map_err(storage_err)?;
        Ok(())
    }

    // ── Epochs ───────────────────────────────────────────────────────────────

    pub fn get_epoch(
        &self,
        conv: &ConversationId,
        epoch: EpochNumber,
    ) -> Result<Option<Epoch>, VeilError> {
        match self.epochs.get(seq_key(conv, epoch)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_epoch(&self, epoch: &Epoch) -> Result<(), VeilError> {
        self.epochs
            .insert(seq_key(&epoch.conversation_id, epoch.epoch_number), ser(epoch)?)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_wrap(
        &self,
        conv: &ConversationId,
        epoch: EpochNumber,
        member_pk: &PublicKeyBytes,
    ) -> Result<Option<EpochMemberWrap>, VeilError> {
        match self
            .epoch_wraps
            .get(wrap_key(conv, epoch, member_pk))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_wrap(&self, wrap: &EpochMemberWrap) -> Result<(), VeilError> {
        self.epoch_wraps
            .insert(
                wrap_key(&wrap.conversation_id, wrap.epoch_number, &wrap.member_public_key),
                ser(wrap)?,
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn wraps_for_epoch(
        &self,
        conv: &ConversationId,
        epoch: EpochNumber,
    ) -> Result<Vec<EpochMemberWrap>, VeilError> {
        let mut out = Vec::new();
        for item in self.epoch_wraps.scan_prefix(wrap_prefix(conv, epoch)) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    /// Bounded-storage invariant: wraps exist only for the current epoch.
    pub fn delete_wraps_for_epoch(
        &self,
        conv: &ConversationId,
        epoch: EpochNumber,
    ) -> Result<(), VeilError> {
        let keys: Vec<_> = self
            .epoch_wraps
            .scan_prefix(wrap_prefix(conv, epoch))
            .keys()
            .collect::<Result<_, _>>()
            .map_err(storage_err)?;
        for key in keys {
            self.epoch_wraps.remove(key).map_err(storage_err)?;
        }
        Ok(())
    }

    // ── Members ──────────────────────────────────────────────────────────────

    pub fn get_member(
        &self,
        conv: &ConversationId,
        principal: &Principal,
    ) -> Result<Option<ConversationMember>, VeilError> {
        match self
            .members
            .get(principal_key(conv, principal))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_member(&self, member: &ConversationMember) -> Result<(), VeilError> {
        self.members
            .insert(
                principal_key(&member.conversation_id, &member.principal),
                ser(member)?,
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Every member row for a conversation, active or left.
    pub fn members_of(&self, conv: &ConversationId) -> Result<Vec<ConversationMember>, VeilError> {
        let mut out = Vec::new();
        for item in self.members.scan_prefix(conv.as_bytes()) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    pub fn active_members(
        &self,
        conv: &ConversationId,
    ) -> Result<Vec<ConversationMember>, VeilError> {
        Ok(self
            .members_of(conv)?
            .into_iter()
            .filter(|m| m.is_active())
            .collect())
    }

    /// Conversations where `principal` has a member row (active or not).
    /// Full scan of the members tree; used only by rare operations (account
    /// deletion).
    pub fn conversations_for_principal(
        &self,
        principal: &Principal,
    ) -> Result<Vec<ConversationId>, VeilError> {
        let needle = principal.key_bytes();
        let mut out = Vec::new();
        for item in self.members.iter() {
            let (key, _) = item.map_err(storage_err)?;
            if key.len() == 65 && key[32..] == needle {
                let mut conv = [0u8; 32];
                conv.copy_from_slice(&key[..32]);
                out.push(ConversationId::from_bytes(conv));
            }
        }
        Ok(out)
    }

    // ── Links ────────────────────────────────────────────────────────────────

    pub fn get_link(&self, id: &LinkId) -> Result<Option<SharedLink>, VeilError> {
        match self.links.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_link(&self, link: &SharedLink) -> Result<(), VeilError> {
        self.links
            .insert(link.link_id.as_bytes(), ser(link)?)
            .map_err(storage_err)?;
        self.conversation_links
            .insert(
                pair_key(link.conversation_id.as_bytes(), link.link_id.as_bytes()),
                b"".as_ref(),
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn links_for_conversation(
        &self,
        conv: &ConversationId,
    ) -> Result<Vec<SharedLink>, VeilError> {
        let mut out = Vec::new();
        for item in self.conversation_links.scan_prefix(conv.as_bytes()) {
            let (key, _) = item.map_err(storage_err)?;
            let mut link_id = [0u8; 32];
            link_id.copy_from_slice(&key[32..]);
            if let Some(link) = self.get_link(&LinkId::from_bytes(link_id))? {
                out.push(link);
            }
        }
        Ok(out)
    }

    // ── Budgets / spending ───────────────────────────────────────────────────

    pub fn get_member_budget(
        &self,
        conv: &ConversationId,
        account: &AccountId,
    ) -> Result<Option<MemberBudget>, VeilError> {
        match self
            .member_budgets
            .get(pair_key(conv.as_bytes(), account.as_bytes()))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_member_budget(&self, budget: &MemberBudget) -> Result<(), VeilError> {
        self.member_budgets
            .insert(
                pair_key(budget.conversation_id.as_bytes(), budget.account_id.as_bytes()),
                ser(budget)?,
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_spending(
        &self,
        conv: &ConversationId,
    ) -> Result<Option<ConversationSpending>, VeilError> {
        match self.spending.get(conv.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_spending(&self, spending: &ConversationSpending) -> Result<(), VeilError> {
        self.spending
            .insert(spending.conversation_id.as_bytes(), ser(spending)?)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Pending removals ─────────────────────────────────────────────────────

    pub fn put_pending_removal(&self, removal: &PendingRemoval) -> Result<(), VeilError> {
        self.pending_removals
            .insert(
                principal_key(&removal.conversation_id, &removal.principal),
                ser(removal)?,
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn pending_removals(
        &self,
        conv: &ConversationId,
    ) -> Result<Vec<PendingRemoval>, VeilError> {
        let mut out = Vec::new();
        for item in self.pending_removals.scan_prefix(conv.as_bytes()) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    pub fn delete_pending_removal(
        &self,
        conv: &ConversationId,
        principal: &Principal,
    ) -> Result<(), VeilError> {
        self.pending_removals
            .remove(principal_key(conv, principal))
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn insert_message(&self, message: &Message) -> Result<(), VeilError> {
        self.messages
            .insert(
                seq_key(&message.conversation_id, message.sequence_number),
                ser(message)?,
            )
            .map_err(storage_err)?;
        self.message_index
            .insert(
                message.message_id.as_bytes(),
                seq_key(&message.conversation_id, message.sequence_number).as_ref(),
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Option<Message>, VeilError> {
        let Some(loc) = self.message_index.get(id.as_bytes()).map_err(storage_err)? else {
            return Ok(None);
        };
        match self.messages.get(&loc).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hard delete. Returns the removed row.
    pub fn delete_message(&self, id: &MessageId) -> Result<Option<Message>, VeilError> {
        let Some(loc) = self.message_index.get(id.as_bytes()).map_err(storage_err)? else {
            return Ok(None);
        };
        self.message_index.remove(id.as_bytes()).map_err(storage_err)?;
        match self.messages.remove(&loc).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Messages with sequence ≥ `from_seq`, ascending, up to `limit`.
    pub fn messages_from(
        &self,
        conv: &ConversationId,
        from_seq: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<Message>, VeilError> {
        let start = seq_key(conv, from_seq);
        let end = seq_key(conv, u64::MAX);
        let mut out = Vec::new();
        for item in self.messages.range(start..=end).take(limit) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    pub fn count_messages(&self, conv: &ConversationId) -> Result<usize, VeilError> {
        let mut n = 0;
        for item in self.messages.scan_prefix(conv.as_bytes()) {
            item.map_err(storage_err)?;
            n += 1;
        }
        Ok(n)
    }

    // ── Usage records / completions ──────────────────────────────────────────

    pub fn get_usage(&self, id: &UsageId) -> Result<Option<UsageRecord>, VeilError> {
        match self.usage_records.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_usage(&self, usage: &UsageRecord) -> Result<(), VeilError> {
        self.usage_records
            .insert(usage.usage_id.as_bytes(), ser(usage)?)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_completion(&self, id: &UsageId) -> Result<Option<LlmCompletion>, VeilError> {
        match self.completions.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_completion(&self, completion: &LlmCompletion) -> Result<(), VeilError> {
        self.completions
            .insert(completion.usage_id.as_bytes(), ser(completion)?)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Shared messages ──────────────────────────────────────────────────────

    pub fn get_shared_message(&self, id: &ShareId) -> Result<Option<SharedMessage>, VeilError> {
        match self.shared_messages.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_shared_message(&self, shared: &SharedMessage) -> Result<(), VeilError> {
        self.shared_messages
            .insert(shared.share_id.as_bytes(), ser(shared)?)
            .map_err(storage_err)?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::constants::FIRST_EPOCH_NUMBER;
    use veil_core::types::{Privilege, SenderType, WalletKind};

    fn conversation(id: ConversationId, owner: AccountId) -> Conversation {
        Conversation {
            conversation_id: id,
            owner,
            current_epoch: FIRST_EPOCH_NUMBER,
            next_sequence: 1,
            rotation_pending: false,
            per_person_budget: None,
            conversation_budget: None,
            title: None,
            title_epoch: FIRST_EPOCH_NUMBER,
            created_at: 0,
        }
    }

    #[test]
    fn wallet_priority_order() {
        let db = StoreDb::open_temp("wallet_priority").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        for (priority, kind) in [(10u8, WalletKind::FreeTier), (0, WalletKind::Purchased)] {
            db.put_wallet(&Wallet {
                wallet_id: WalletId::random(),
                owner: Some(owner),
                kind,
                balance: 0,
                priority,
                ledger_seq: 0,
                created_at: 0,
            })
            .unwrap();
        }
        let wallets = db.wallets_for_account(&owner).unwrap();
        assert_eq!(wallets.len(), 2);
        assert_eq!(wallets[0].kind, WalletKind::Purchased);
        assert_eq!(wallets[1].kind, WalletKind::FreeTier);
    }

    #[test]
    fn sequence_pair_allocation_is_monotonic() {
        let db = StoreDb::open_temp("seq_pair").unwrap();
        let conv_id = ConversationId::random();
        db.put_conversation(&conversation(conv_id, AccountId::from_bytes([1; 32])))
            .unwrap();

        let a = db.allocate_sequence_pair(&conv_id).unwrap();
        let b = db.allocate_sequence_pair(&conv_id).unwrap();
        assert_eq!((a.user_seq, a.ai_seq), (1, 2));
        assert_eq!((b.user_seq, b.ai_seq), (3, 4));
        assert_eq!(a.epoch_number, FIRST_EPOCH_NUMBER);

        let conv = db.get_conversation(&conv_id).unwrap().unwrap();
        assert_eq!(conv.next_sequence, 5);
    }

    #[test]
    fn concurrent_sequence_allocation_never_overlaps() {
        let db = std::sync::Arc::new(StoreDb::open_temp("seq_concurrent").unwrap());
        let conv_id = ConversationId::random();
        db.put_conversation(&conversation(conv_id, AccountId::from_bytes([1; 32])))
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = std::sync::Arc::clone(&db);
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| db.allocate_sequence_pair(&conv_id).unwrap().user_seq)
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "duplicate sequence {seq}");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn message_index_round_trip_and_delete() {
        let db = StoreDb::open_temp("msg_index").unwrap();
        let conv_id = ConversationId::random();
        let msg_id = MessageId::random();
        db.insert_message(&Message {
            message_id: msg_id,
            conversation_id: conv_id,
            epoch_number: 1,
            sequence_number: 1,
            sender_type: SenderType::User,
            sender_account: None,
            sender_display_name: None,
            payer_account: None,
            cost: 0,
            blob: vec![1, 2, 3],
            created_at: 0,
        })
        .unwrap();

        assert!(db.get_message(&msg_id).unwrap().is_some());
        let removed = db.delete_message(&msg_id).unwrap().unwrap();
        assert_eq!(removed.sequence_number, 1);
        assert!(db.get_message(&msg_id).unwrap().is_none());
        assert_eq!(db.count_messages(&conv_id).unwrap(), 0);
    }

    #[test]
    fn wrap_deletion_is_per_epoch() {
        let db = StoreDb::open_temp("wraps").unwrap();
        let conv_id = ConversationId::random();
        for epoch in [1u64, 2] {
            db.put_wrap(&EpochMemberWrap {
                conversation_id: conv_id,
                epoch_number: epoch,
                member_public_key: [7; 32],
                wrapped_key: vec![0; 49],
                privilege: Privilege::Write,
                visible_from_epoch: 1,
            })
            .unwrap();
        }
        db.delete_wraps_for_epoch(&conv_id, 1).unwrap();
        assert!(db.wraps_for_epoch(&conv_id, 1).unwrap().is_empty());
        assert_eq!(db.wraps_for_epoch(&conv_id, 2).unwrap().len(), 1);
    }

    #[test]
    fn cascade_delete_clears_dependents() {
        let db = StoreDb::open_temp("cascade").unwrap();
        let conv_id = ConversationId::random();
        let owner = AccountId::from_bytes([1; 32]);
        db.put_conversation(&conversation(conv_id, owner)).unwrap();
        db.put_member(&ConversationMember {
            conversation_id: conv_id,
            principal: Principal::Account(owner),
            privilege: Privilege::Owner,
            visible_from_epoch: 1,
            joined_at: 0,
            left_at: None,
        })
        .unwrap();
        let msg_id = MessageId::random();
        db.insert_message(&Message {
            message_id: msg_id,
            conversation_id: conv_id,
            epoch_number: 1,
            sequence_number: 1,
            sender_type: SenderType::User,
            sender_account: Some(owner),
            sender_display_name: None,
            payer_account: None,
            cost: 0,
            blob: vec![],
            created_at: 0,
        })
        .unwrap();

        db.delete_conversation_cascade(&conv_id).unwrap();
        assert!(db.get_conversation(&conv_id).unwrap().is_none());
        assert!(db.members_of(&conv_id).unwrap().is_empty());
        assert!(db.get_message(&msg_id).unwrap().is_none());
    }
}
