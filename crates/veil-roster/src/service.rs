//! Membership service: conversation lifecycle, add/remove/leave, privilege
//! updates, shared links, and the pending-removal queue.
//!
//! Removal never rotates keys inline. It locks the principal out server-side
//! immediately (`left_at`/`revoked_at`), queues a pending removal, and marks
//! the conversation `rotation_pending`; the next write-privileged send
//! carries the actual rotation.

use std::sync::Arc;

use tracing::info;

use veil_broadcast::{ChatEvent, HubRegistry};
use veil_core::constants::{DEFAULT_VISIBLE_FROM_EPOCH, FIRST_EPOCH_NUMBER};
use veil_core::conversation::{
    Conversation, ConversationMember, Epoch, EpochMemberWrap, PendingRemoval, SharedLink,
};
use veil_core::types::{
    AccountId, ConversationId, Credits, EpochNumber, LinkId, Principal, Privilege, PublicKeyBytes,
};
use veil_core::{Clock, VeilError};
use veil_store::StoreDb;

/// Owner-submitted material for a conversation's first epoch.
pub struct FirstEpochSubmission {
    pub epoch_public_key: PublicKeyBytes,
    pub confirmation_hash: [u8; 32],
    pub owner_wrap: Vec<u8>,
    pub encrypted_title: Option<Vec<u8>>,
}

pub struct RosterService {
    db: Arc<StoreDb>,
    hubs: Arc<HubRegistry>,
    clock: Arc<dyn Clock>,
}

impl RosterService {
    pub fn new(db: Arc<StoreDb>, hubs: Arc<HubRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { db, hubs, clock }
    }

    // ── Access checks ─────────────────────────────────────────────────────────

    /// Resolve a principal's active membership. Missing conversation and
    /// missing/inactive membership are the same error on purpose: the
    /// response never reveals whether the conversation exists.
    pub fn require_active_member(
        &self,
        conversation_id: &ConversationId,
        principal: &Principal,
    ) -> Result<(Conversation, ConversationMember), VeilError> {
        let conv = self
            .db
            .get_conversation(conversation_id)?
            .ok_or(VeilError::ConversationNotFound)?;
        let member = self
            .db
            .get_member(conversation_id, principal)?
            .filter(|m| m.is_active())
            .ok_or(VeilError::ConversationNotFound)?;
        // A link member is only usable while its link row is live.
        if let Principal::Link(link_id) = principal {
            self.db
                .get_link(link_id)?
                .filter(|l| l.is_active())
                .ok_or(VeilError::ConversationNotFound)?;
        }
        Ok((conv, member))
    }

    // ── Conversation lifecycle ────────────────────────────────────────────────

    /// Create a conversation at epoch 1 with the owner as its only member.
    pub fn create_conversation(
        &self,
        owner: AccountId,
        first: FirstEpochSubmission,
    ) -> Result<Conversation, VeilError> {
        let now = self.clock.now();
        let owner_account = self
            .db
            .get_account(&owner)?
            .ok_or_else(|| VeilError::AccountNotFound(owner.to_b58()))?;

        let conversation = Conversation {
            conversation_id: ConversationId::random(),
            owner,
            current_epoch: FIRST_EPOCH_NUMBER,
            next_sequence: 1,
            rotation_pending: false,
            per_person_budget: None,
            conversation_budget: None,
            title: first.encrypted_title,
            title_epoch: FIRST_EPOCH_NUMBER,
            created_at: now,
        };
        self.db.put_conversation(&conversation)?;
        self.db.put_epoch(&Epoch {
            conversation_id: conversation.conversation_id,
            epoch_number: FIRST_EPOCH_NUMBER,
            public_key: first.epoch_public_key,
            confirmation_hash: first.confirmation_hash,
            chain_link: None,
            created_at: now,
        })?;
        self.db.put_member(&ConversationMember {
            conversation_id: conversation.conversation_id,
            principal: Principal::Account(owner),
            privilege: Privilege::Owner,
            visible_from_epoch: FIRST_EPOCH_NUMBER,
            joined_at: now,
            left_at: None,
        })?;
        self.db.put_wrap(&EpochMemberWrap {
            conversation_id: conversation.conversation_id,
            epoch_number: FIRST_EPOCH_NUMBER,
            member_public_key: owner_account.public_key,
            wrapped_key: first.owner_wrap,
            privilege: Privilege::Owner,
            visible_from_epoch: FIRST_EPOCH_NUMBER,
        })?;

        info!(conversation = %conversation.conversation_id, owner = %owner, "conversation created");
        Ok(conversation)
    }

    /// Owner-only budget caps.
    pub fn set_budgets(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        per_person_budget: Option<Credits>,
        conversation_budget: Option<Credits>,
    ) -> Result<(), VeilError> {
        let (conv, _) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if conv.owner != actor {
            return Err(VeilError::PrivilegeInsufficient);
        }
        self.db.update_conversation(conversation_id, |c| {
            c.per_person_budget = per_person_budget;
            c.conversation_budget = conversation_budget;
        })?;
        Ok(())
    }

    /// Replace the title blob (encrypted under the current epoch).
    pub fn update_title(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        encrypted_title: Vec<u8>,
    ) -> Result<EpochNumber, VeilError> {
        let (conv, member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if !member.privilege.can_send() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        let epoch = conv.current_epoch;
        self.db.update_conversation(conversation_id, |c| {
            c.title = Some(encrypted_title.clone());
            c.title_epoch = epoch;
        })?;
        Ok(epoch)
    }

    // ── Members ──────────────────────────────────────────────────────────────

    /// Add an account member without rotating: the actor unwrapped the
    /// current epoch key client-side and submits it wrapped for the target.
    pub fn add_member(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        target: AccountId,
        wrapped_key: Vec<u8>,
        privilege: Privilege,
        visible_from_epoch: Option<EpochNumber>,
    ) -> Result<(), VeilError> {
        let now = self.clock.now();
        let (conv, acting_member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if !acting_member.privilege.can_add_members() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        if privilege >= Privilege::Owner {
            return Err(VeilError::PrivilegeInsufficient);
        }
        let target_account = self
            .db
            .get_account(&target)?
            .ok_or_else(|| VeilError::AccountNotFound(target.to_b58()))?;

        let principal = Principal::Account(target);
        if self
            .db
            .get_member(conversation_id, &principal)?
            .is_some_and(|m| m.is_active())
        {
            return Err(VeilError::AlreadyMember);
        }

        let visible_from_epoch = visible_from_epoch.unwrap_or(DEFAULT_VISIBLE_FROM_EPOCH);
        self.db.put_member(&ConversationMember {
            conversation_id: *conversation_id,
            principal,
            privilege,
            visible_from_epoch,
            joined_at: now,
            left_at: None,
        })?;
        self.db.put_wrap(&EpochMemberWrap {
            conversation_id: *conversation_id,
            epoch_number: conv.current_epoch,
            member_public_key: target_account.public_key,
            wrapped_key,
            privilege,
            visible_from_epoch,
        })?;

        info!(conversation = %conversation_id, target = %target, "member added");
        self.hubs.hub(*conversation_id).publish(ChatEvent::MemberAdded {
            conversation_id: conversation_id.to_hex(),
            member: target.to_b58(),
            privilege: privilege.as_str().to_string(),
        });
        Ok(())
    }

    /// Queue an account member's removal: immediate lockout, keys rotate on
    /// the next send.
    pub fn remove_member(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        target: AccountId,
    ) -> Result<(), VeilError> {
        let (conv, acting_member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if target == conv.owner {
            return Err(VeilError::CannotRemoveOwner);
        }
        if target == actor {
            return Err(VeilError::CannotRemoveSelf);
        }
        if !acting_member.privilege.can_remove_members() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        let principal = Principal::Account(target);
        let target_member = self
            .db
            .get_member(conversation_id, &principal)?
            .filter(|m| m.is_active())
            .ok_or(VeilError::ConversationNotFound)?;
        // Admins manage ordinary members; only the owner outranks an admin.
        if target_member.privilege >= Privilege::Admin && acting_member.privilege != Privilege::Owner
        {
            return Err(VeilError::PrivilegeInsufficient);
        }

        self.queue_removal(conversation_id, principal, target.to_b58())
    }

    /// Voluntary exit. The owner leaving deletes the conversation outright.
    pub fn leave(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
    ) -> Result<(), VeilError> {
        let (conv, _) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if conv.owner == actor {
            self.db.delete_conversation_cascade(conversation_id)?;
            info!(conversation = %conversation_id, "owner left; conversation deleted");
            self.hubs.hub(*conversation_id).publish(ChatEvent::MemberRemoved {
                conversation_id: conversation_id.to_hex(),
                member: actor.to_b58(),
            });
            return Ok(());
        }
        self.queue_removal(conversation_id, Principal::Account(actor), actor.to_b58())
    }

    /// Owner adjusts a member's privilege. Admins may adjust non-admins.
    pub fn set_privilege(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        target: AccountId,
        privilege: Privilege,
    ) -> Result<(), VeilError> {
        let (conv, acting_member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if target == conv.owner || privilege >= Privilege::Owner {
            return Err(VeilError::PrivilegeInsufficient);
        }
        if !acting_member.privilege.can_add_members() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        let principal = Principal::Account(target);
        let mut target_member = self
            .db
            .get_member(conversation_id, &principal)?
            .filter(|m| m.is_active())
            .ok_or(VeilError::ConversationNotFound)?;
        if target_member.privilege >= Privilege::Admin && acting_member.privilege != Privilege::Owner
        {
            return Err(VeilError::PrivilegeInsufficient);
        }
        target_member.privilege = privilege;
        self.db.put_member(&target_member)?;
        Ok(())
    }

    // ── Shared links ─────────────────────────────────────────────────────────

    /// Create a shared link: a virtual member wrapped into the current epoch
    /// exactly like an account member.
    pub fn create_link(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        link_public_key: PublicKeyBytes,
        wrapped_key: Vec<u8>,
        privilege: Privilege,
        visible_from_epoch: Option<EpochNumber>,
    ) -> Result<SharedLink, VeilError> {
        let now = self.clock.now();
        let (conv, acting_member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if !acting_member.privilege.can_manage_links() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        if privilege > Privilege::Write {
            return Err(VeilError::PrivilegeInsufficient);
        }

        let link_id = LinkId::from_public_key(&link_public_key);
        if self
            .db
            .get_member(conversation_id, &Principal::Link(link_id))?
            .is_some_and(|m| m.is_active())
        {
            return Err(VeilError::AlreadyMember);
        }

        let visible_from_epoch = visible_from_epoch.unwrap_or(conv.current_epoch);
        let link = SharedLink {
            link_id,
            conversation_id: *conversation_id,
            public_key: link_public_key,
            privilege,
            visible_from_epoch,
            created_at: now,
            revoked_at: None,
        };
        self.db.put_link(&link)?;
        self.db.put_member(&ConversationMember {
            conversation_id: *conversation_id,
            principal: Principal::Link(link_id),
            privilege,
            visible_from_epoch,
            joined_at: now,
            left_at: None,
        })?;
        self.db.put_wrap(&EpochMemberWrap {
            conversation_id: *conversation_id,
            epoch_number: conv.current_epoch,
            member_public_key: link_public_key,
            wrapped_key,
            privilege,
            visible_from_epoch,
        })?;

        info!(conversation = %conversation_id, link = %link_id, "link created");
        self.hubs.hub(*conversation_id).publish(ChatEvent::MemberAdded {
            conversation_id: conversation_id.to_hex(),
            member: link_id.to_hex(),
            privilege: privilege.as_str().to_string(),
        });
        Ok(link)
    }

    /// Revoke a link: immediate lockout plus a queued removal, like removing
    /// an account member.
    pub fn revoke_link(
        &self,
        conversation_id: &ConversationId,
        actor: AccountId,
        link_id: LinkId,
    ) -> Result<(), VeilError> {
        let now = self.clock.now();
        let (_, acting_member) =
            self.require_active_member(conversation_id, &Principal::Account(actor))?;
        if !acting_member.privilege.can_manage_links() {
            return Err(VeilError::PrivilegeInsufficient);
        }
        let mut link = self
            .db
            .get_link(&link_id)?
            .filter(|l| l.is_active() && l.conversation_id == *conversation_id)
            .ok_or(VeilError::ConversationNotFound)?;
        link.revoked_at = Some(now);
        self.db.put_link(&link)?;

        self.queue_removal(conversation_id, Principal::Link(link_id), link_id.to_hex())
    }

    // ── Account deletion ─────────────────────────────────────────────────────

    /// Delete an account: leave every conversation (queueing rotations),
    /// delete owned conversations, then drop the account row while keeping
    /// all financial rows with the owner reference nulled.
    pub fn delete_account(&self, account_id: AccountId) -> Result<(), VeilError> {
        let principal = Principal::Account(account_id);
        for conversation_id in self.db.conversations_for_principal(&principal)? {
            let Some(conv) = self.db.get_conversation(&conversation_id)? else {
                continue;
            };
            if conv.owner == account_id {
                self.db.delete_conversation_cascade(&conversation_id)?;
            } else if self
                .db
                .get_member(&conversation_id, &principal)?
                .is_some_and(|m| m.is_active())
            {
                self.queue_removal(&conversation_id, principal, account_id.to_b58())?;
            }
        }

        for wallet in self.db.wallets_for_account(&account_id)? {
            self.db.detach_wallet_owner(&wallet.wallet_id)?;
        }
        self.db.delete_account_row(&account_id)?;
        info!(account = %account_id, "account deleted; financial rows preserved");
        Ok(())
    }

    // ── Shared removal path ──────────────────────────────────────────────────

    fn queue_removal(
        &self,
        conversation_id: &ConversationId,
        principal: Principal,
        member_ref: String,
    ) -> Result<(), VeilError> {
        let now = self.clock.now();
        if let Some(mut member) = self.db.get_member(conversation_id, &principal)? {
            if member.left_at.is_none() {
                member.left_at = Some(now);
                self.db.put_member(&member)?;
            }
        }
        self.db.put_pending_removal(&PendingRemoval {
            conversation_id: *conversation_id,
            principal,
            queued_at: now,
        })?;
        self.db
            .update_conversation(conversation_id, |c| c.rotation_pending = true)?;

        info!(conversation = %conversation_id, member = %member_ref, "removal queued");
        let hub = self.hubs.hub(*conversation_id);
        hub.publish(ChatEvent::MemberRemoved {
            conversation_id: conversation_id.to_hex(),
            member: member_ref,
        });
        hub.publish(ChatEvent::RotationPending {
            conversation_id: conversation_id.to_hex(),
        });
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::account::Account;
    use veil_core::ManualClock;
    use veil_crypto::EciesKeyPair;
    use veil_epoch::keys::{create_first_epoch, wrap_for_member};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        roster: RosterService,
        db: Arc<StoreDb>,
        conversation_id: ConversationId,
        owner: AccountId,
        epoch_secret: [u8; 32],
    }

    fn seed_account(db: &StoreDb, name: &str) -> (AccountId, EciesKeyPair) {
        let keys = EciesKeyPair::generate();
        let account_id = AccountId::from_public_key(&keys.public_key());
        db.put_account(&Account {
            account_id,
            email: format!("{name}@example.com"),
            username: name.to_string(),
            public_key: keys.public_key(),
            password_wrapped_key: vec![0; 49],
            recovery_wrapped_key: vec![0; 49],
            email_verified: true,
            totp_enabled: false,
            recovery_acknowledged: true,
            created_at: NOW,
        })
        .unwrap();
        (account_id, keys)
    }

    fn fixture(name: &str) -> Fixture {
        let db = Arc::new(StoreDb::open_temp(&format!("roster_{name}")).unwrap());
        let hubs = Arc::new(HubRegistry::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let roster = RosterService::new(Arc::clone(&db), hubs, clock);

        let (owner, owner_keys) = seed_account(&db, &format!("owner_{name}"));
        let first = create_first_epoch(&owner_keys.public_key()).unwrap();
        let epoch_secret = *first.keys.secret_bytes();
        let conv = roster
            .create_conversation(
                owner,
                FirstEpochSubmission {
                    epoch_public_key: first.epoch_public_key,
                    confirmation_hash: first.confirmation_hash,
                    owner_wrap: first.owner_wrap,
                    encrypted_title: None,
                },
            )
            .unwrap();
        Fixture {
            roster,
            db,
            conversation_id: conv.conversation_id,
            owner,
            epoch_secret,
        }
    }

    fn add_member(fx: &Fixture, name: &str, privilege: Privilege) -> AccountId {
        let (account_id, keys) = seed_account(&fx.db, name);
        let wrap = wrap_for_member(&fx.epoch_secret, &keys.public_key()).unwrap();
        fx.roster
            .add_member(&fx.conversation_id, fx.owner, account_id, wrap, privilege, None)
            .unwrap();
        account_id
    }

    #[test]
    fn create_seeds_epoch_member_and_wrap() {
        let fx = fixture("create");
        let conv = fx.db.get_conversation(&fx.conversation_id).unwrap().unwrap();
        assert_eq!(conv.current_epoch, FIRST_EPOCH_NUMBER);
        assert!(fx.db.get_epoch(&fx.conversation_id, 1).unwrap().is_some());
        assert_eq!(fx.db.active_members(&fx.conversation_id).unwrap().len(), 1);
        assert_eq!(fx.db.wraps_for_epoch(&fx.conversation_id, 1).unwrap().len(), 1);
    }

    #[test]
    fn add_member_writes_wrap_and_defaults_full_history() {
        let fx = fixture("add");
        let bob = add_member(&fx, "bob", Privilege::Write);

        let member = fx
            .db
            .get_member(&fx.conversation_id, &Principal::Account(bob))
            .unwrap()
            .unwrap();
        assert_eq!(member.visible_from_epoch, 1);
        assert_eq!(fx.db.wraps_for_epoch(&fx.conversation_id, 1).unwrap().len(), 2);

        // Adding again is a conflict.
        let err = fx
            .roster
            .add_member(&fx.conversation_id, fx.owner, bob, vec![0; 49], Privilege::Write, None)
            .unwrap_err();
        assert!(matches!(err, VeilError::AlreadyMember));
    }

    #[test]
    fn write_member_cannot_add() {
        let fx = fixture("add_privilege");
        let bob = add_member(&fx, "bob", Privilege::Write);
        let (carol, _) = seed_account(&fx.db, "carol");
        let err = fx
            .roster
            .add_member(&fx.conversation_id, bob, carol, vec![0; 49], Privilege::Read, None)
            .unwrap_err();
        assert!(matches!(err, VeilError::PrivilegeInsufficient));
    }

    #[test]
    fn removal_locks_out_and_flags_rotation() {
        let fx = fixture("remove");
        let bob = add_member(&fx, "bob", Privilege::Write);

        fx.roster
            .remove_member(&fx.conversation_id, fx.owner, bob)
            .unwrap();

        let conv = fx.db.get_conversation(&fx.conversation_id).unwrap().unwrap();
        assert!(conv.rotation_pending);
        assert_eq!(fx.db.pending_removals(&fx.conversation_id).unwrap().len(), 1);
        // Lockout is immediate even though keys have not rotated.
        let err = fx
            .roster
            .require_active_member(&fx.conversation_id, &Principal::Account(bob))
            .unwrap_err();
        assert!(matches!(err, VeilError::ConversationNotFound));
    }

    #[test]
    fn removal_guard_rails() {
        let fx = fixture("remove_guards");
        let bob = add_member(&fx, "bob", Privilege::Admin);
        let carol = add_member(&fx, "carol", Privilege::Admin);

        assert!(matches!(
            fx.roster.remove_member(&fx.conversation_id, fx.owner, fx.owner),
            Err(VeilError::CannotRemoveOwner)
        ));
        assert!(matches!(
            fx.roster.remove_member(&fx.conversation_id, bob, bob),
            Err(VeilError::CannotRemoveSelf)
        ));
        // Admin vs admin: only the owner may.
        assert!(matches!(
            fx.roster.remove_member(&fx.conversation_id, bob, carol),
            Err(VeilError::PrivilegeInsufficient)
        ));
        fx.roster
            .remove_member(&fx.conversation_id, fx.owner, carol)
            .unwrap();
    }

    #[test]
    fn owner_leave_deletes_conversation() {
        let fx = fixture("owner_leave");
        add_member(&fx, "bob", Privilege::Write);
        fx.roster.leave(&fx.conversation_id, fx.owner).unwrap();
        assert!(fx.db.get_conversation(&fx.conversation_id).unwrap().is_none());
        assert!(fx.db.members_of(&fx.conversation_id).unwrap().is_empty());
    }

    #[test]
    fn link_lifecycle() {
        let fx = fixture("links");
        let guest_keys = EciesKeyPair::from_seed(b"fragment");
        let wrap = wrap_for_member(&fx.epoch_secret, &guest_keys.public_key()).unwrap();

        let link = fx
            .roster
            .create_link(
                &fx.conversation_id,
                fx.owner,
                guest_keys.public_key(),
                wrap,
                Privilege::Write,
                None,
            )
            .unwrap();
        assert_eq!(link.link_id, LinkId::from_public_key(&guest_keys.public_key()));

        // The link is a member with a wrap, like anyone else.
        assert!(fx
            .roster
            .require_active_member(&fx.conversation_id, &Principal::Link(link.link_id))
            .is_ok());
        assert_eq!(fx.db.wraps_for_epoch(&fx.conversation_id, 1).unwrap().len(), 2);

        // Admin-level links are refused.
        let other = EciesKeyPair::from_seed(b"other");
        assert!(matches!(
            fx.roster.create_link(
                &fx.conversation_id,
                fx.owner,
                other.public_key(),
                vec![0; 49],
                Privilege::Admin,
                None,
            ),
            Err(VeilError::PrivilegeInsufficient)
        ));

        fx.roster
            .revoke_link(&fx.conversation_id, fx.owner, link.link_id)
            .unwrap();
        assert!(matches!(
            fx.roster
                .require_active_member(&fx.conversation_id, &Principal::Link(link.link_id)),
            Err(VeilError::ConversationNotFound)
        ));
        assert!(fx
            .db
            .get_conversation(&fx.conversation_id)
            .unwrap()
            .unwrap()
            .rotation_pending);
    }

    #[test]
    fn delete_account_leaves_groups_and_detaches_wallets() {
        let fx = fixture("delete_account");
        let bob = add_member(&fx, "bob", Privilege::Write);

        // Bob owns a conversation of his own and has a wallet.
        let bob_keys_public = fx.db.get_account(&bob).unwrap().unwrap().public_key;
        let bob_first = create_first_epoch(&bob_keys_public).unwrap();
        let bob_conv = fx
            .roster
            .create_conversation(
                bob,
                FirstEpochSubmission {
                    epoch_public_key: bob_first.epoch_public_key,
                    confirmation_hash: bob_first.confirmation_hash,
                    owner_wrap: bob_first.owner_wrap,
                    encrypted_title: None,
                },
            )
            .unwrap();
        let wallet_id = veil_core::types::WalletId::random();
        fx.db
            .put_wallet(&veil_core::account::Wallet {
                wallet_id,
                owner: Some(bob),
                kind: veil_core::types::WalletKind::Purchased,
                balance: 123,
                priority: 1,
                ledger_seq: 0,
                created_at: NOW,
            })
            .unwrap();

        fx.roster.delete_account(bob).unwrap();

        // His owned conversation is gone; the shared one has a queued removal.
        assert!(fx.db.get_conversation(&bob_conv.conversation_id).unwrap().is_none());
        assert!(fx
            .db
            .get_conversation(&fx.conversation_id)
            .unwrap()
            .unwrap()
            .rotation_pending);
        // Wallet survives, detached from the deleted account.
        let wallet = fx.db.get_wallet(&wallet_id).unwrap().unwrap();
        assert_eq!(wallet.owner, None);
        assert_eq!(wallet.balance, 123);
        assert!(fx.db.get_account(&bob).unwrap().is_none());
    }
}
