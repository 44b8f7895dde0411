//! Server-side epoch lifecycle. The server stores public keys, confirmation
//! hashes, chain links, and wraps; the private material inside them is opaque
//! here. Rotation submissions are validated and applied as one serialized
//! transaction behind the per-conversation advisory lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use veil_broadcast::{ChatEvent, HubRegistry};
use veil_core::conversation::{Epoch, EpochMemberWrap};
use veil_core::types::{ConversationId, EpochNumber, Principal, Privilege, PublicKeyBytes};
use veil_core::{Clock, VeilError};
use veil_store::{KeyedLocks, StoreDb};

use crate::keys::MemberWrap;

/// A client's atomic rotation submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationSubmission {
    pub expected_epoch: EpochNumber,
    pub new_epoch_public_key: PublicKeyBytes,
    pub confirmation_hash: [u8; 32],
    pub member_wraps: Vec<MemberWrap>,
    pub chain_link: Vec<u8>,
    /// Title re-encrypted under the new epoch key, if the client included one.
    pub encrypted_title: Option<Vec<u8>>,
}

pub struct EpochManager {
    db: Arc<StoreDb>,
    hubs: Arc<HubRegistry>,
    locks: Arc<KeyedLocks<ConversationId>>,
    clock: Arc<dyn Clock>,
}

impl EpochManager {
    pub fn new(
        db: Arc<StoreDb>,
        hubs: Arc<HubRegistry>,
        locks: Arc<KeyedLocks<ConversationId>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { db, hubs, locks, clock }
    }

    /// The wrap set a rotation must cover: every active member and active
    /// link, minus anything queued for removal, keyed by wrap-target public
    /// key with the privilege/visibility to replicate onto the new wraps.
    pub fn expected_wrap_targets(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<HashMap<PublicKeyBytes, (Privilege, EpochNumber)>, VeilError> {
        let pending: HashSet<[u8; 33]> = self
            .db
            .pending_removals(conversation_id)?
            .iter()
            .map(|r| r.principal.key_bytes())
            .collect();

        let mut targets = HashMap::new();
        for member in self.db.active_members(conversation_id)? {
            if pending.contains(&member.principal.key_bytes()) {
                continue;
            }
            let public_key = match member.principal {
                Principal::Account(account_id) => {
                    self.db
                        .get_account(&account_id)?
                        .ok_or_else(|| VeilError::AccountNotFound(account_id.to_b58()))?
                        .public_key
                }
                Principal::Link(link_id) => {
                    self.db
                        .get_link(&link_id)?
                        .filter(|l| l.is_active())
                        .ok_or(VeilError::ConversationNotFound)?
                        .public_key
                }
            };
            targets.insert(public_key, (member.privilege, member.visible_from_epoch));
        }
        Ok(targets)
    }

    /// Apply a rotation submission atomically (spec'd server transaction).
    /// Serialized behind the per-conversation lock; concurrent sends that
    /// lose the race fail `stale-epoch` at their commit and retry.
    pub async fn submit_rotation(
        &self,
        conversation_id: ConversationId,
        actor: &Principal,
        submission: RotationSubmission,
    ) -> Result<EpochNumber, VeilError> {
        let _guard = self.locks.acquire(conversation_id).await;
        let now = self.clock.now();

        let conv = self
            .db
            .get_conversation(&conversation_id)?
            .ok_or(VeilError::ConversationNotFound)?;
        let member = self
            .db
            .get_member(&conversation_id, actor)?
            .filter(|m| m.is_active())
            .ok_or(VeilError::ConversationNotFound)?;
        if !member.privilege.can_rotate() {
            return Err(VeilError::PrivilegeInsufficient);
        }

        // Re-read under lock: a rotation that lost the race is stale.
        if submission.expected_epoch != conv.current_epoch {
            return Err(VeilError::StaleEpoch {
                submitted: submission.expected_epoch,
                current: conv.current_epoch,
            });
        }

        // The submitted wraps must cover the remaining membership exactly.
        let expected = self.expected_wrap_targets(&conversation_id)?;
        let mut submitted = HashSet::new();
        for wrap in &submission.member_wraps {
            if !submitted.insert(wrap.member_public_key) {
                return Err(VeilError::WrapSetMismatch);
            }
        }
        if submitted.len() != expected.len()
            || !expected.keys().all(|pk| submitted.contains(pk))
        {
            return Err(VeilError::WrapSetMismatch);
        }

        let old_epoch = conv.current_epoch;
        let new_epoch = old_epoch + 1;

        self.db.put_epoch(&Epoch {
            conversation_id,
            epoch_number: new_epoch,
            public_key: submission.new_epoch_public_key,
            confirmation_hash: submission.confirmation_hash,
            chain_link: Some(submission.chain_link.clone()),
            created_at: now,
        })?;

        for wrap in &submission.member_wraps {
            let (privilege, visible_from_epoch) = expected[&wrap.member_public_key];
            self.db.put_wrap(&EpochMemberWrap {
                conversation_id,
                epoch_number: new_epoch,
                member_public_key: wrap.member_public_key,
                wrapped_key: wrap.wrapped_key.clone(),
                privilege,
                visible_from_epoch,
            })?;
        }

        // Bounded storage: only the current epoch keeps wraps.
        self.db.delete_wraps_for_epoch(&conversation_id, old_epoch)?;

        // Finalize queued removals. Lockout (`left_at`/`revoked_at`) was
        // applied when the removal was queued; this pass makes it durable for
        // any row the queue-time write missed and clears the queue.
        for removal in self.db.pending_removals(&conversation_id)? {
            if let Some(mut row) = self.db.get_member(&conversation_id, &removal.principal)? {
                if row.left_at.is_none() {
                    row.left_at = Some(now);
                    self.db.put_member(&row)?;
                }
            }
            if let Principal::Link(link_id) = removal.principal {
                if let Some(mut link) = self.db.get_link(&link_id)? {
                    if link.revoked_at.is_none() {
                        link.revoked_at = Some(now);
                        self.db.put_link(&link)?;
                    }
                }
            }
            self.db.delete_pending_removal(&conversation_id, &removal.principal)?;
        }

        self.db.update_conversation(&conversation_id, |c| {
            c.current_epoch = new_epoch;
            c.rotation_pending = false;
            if let Some(title) = &submission.encrypted_title {
                c.title = Some(title.clone());
                c.title_epoch = new_epoch;
            }
        })?;

        info!(
            conversation = %conversation_id,
            epoch = new_epoch,
            wraps = submission.member_wraps.len(),
            "rotation committed"
        );

        self.hubs.hub(conversation_id).publish(ChatEvent::RotationComplete {
            conversation_id: conversation_id.to_hex(),
            new_epoch_number: new_epoch,
        });

        Ok(new_epoch)
    }
}

/// Build the in-band `rotation-required` signal for a conversation with
/// queued removals: current epoch plus the pending principals.
pub fn rotation_required_error(
    db: &StoreDb,
    conversation_id: &ConversationId,
    current_epoch: EpochNumber,
) -> VeilError {
    let pending = db
        .pending_removals(conversation_id)
        .map(|rows| {
            rows.into_iter()
                .map(|r| match r.principal {
                    Principal::Account(id) => id.to_b58(),
                    Principal::Link(id) => id.to_hex(),
                })
                .collect()
        })
        .unwrap_or_default();
    VeilError::RotationRequired {
        current_epoch,
        pending_removals: pending,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::account::Account;
    use veil_core::constants::FIRST_EPOCH_NUMBER;
    use veil_core::conversation::{Conversation, ConversationMember, PendingRemoval};
    use veil_core::types::AccountId;
    use veil_core::ManualClock;
    use veil_crypto::EciesKeyPair;

    use crate::keys::{create_first_epoch, rotate};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        manager: EpochManager,
        db: Arc<StoreDb>,
        hubs: Arc<HubRegistry>,
        conversation_id: ConversationId,
        owner: TestMember,
        epoch_secret: [u8; 32],
    }

    struct TestMember {
        account_id: AccountId,
        keys: EciesKeyPair,
    }

    fn seed_account(db: &StoreDb, keys: &EciesKeyPair, name: &str) -> AccountId {
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
        account_id
    }

    fn seed_member(
        db: &StoreDb,
        conversation_id: ConversationId,
        account_id: AccountId,
        privilege: Privilege,
    ) {
        db.put_member(&ConversationMember {
            conversation_id,
            principal: Principal::Account(account_id),
            privilege,
            visible_from_epoch: FIRST_EPOCH_NUMBER,
            joined_at: NOW,
            left_at: None,
        })
        .unwrap();
    }

    fn fixture(name: &str) -> Fixture {
        let db = Arc::new(StoreDb::open_temp(&format!("epoch_mgr_{name}")).unwrap());
        let hubs = Arc::new(HubRegistry::new());
        let locks = Arc::new(KeyedLocks::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let manager =
            EpochManager::new(Arc::clone(&db), Arc::clone(&hubs), locks, clock);

        let owner_keys = EciesKeyPair::generate();
        let owner_id = seed_account(&db, &owner_keys, &format!("owner_{name}"));
        let conversation_id = ConversationId::random();
        let first = create_first_epoch(&owner_keys.public_key()).unwrap();

        db.put_conversation(&Conversation {
            conversation_id,
            owner: owner_id,
            current_epoch: FIRST_EPOCH_NUMBER,
            next_sequence: 1,
            rotation_pending: false,
            per_person_budget: None,
            conversation_budget: None,
            title: None,
            title_epoch: FIRST_EPOCH_NUMBER,
            created_at: NOW,
        })
        .unwrap();
        db.put_epoch(&Epoch {
            conversation_id,
            epoch_number: FIRST_EPOCH_NUMBER,
            public_key: first.epoch_public_key,
            confirmation_hash: first.confirmation_hash,
            chain_link: None,
            created_at: NOW,
        })
        .unwrap();
        seed_member(&db, conversation_id, owner_id, Privilege::Owner);
        db.put_wrap(&EpochMemberWrap {
            conversation_id,
            epoch_number: FIRST_EPOCH_NUMBER,
            member_public_key: owner_keys.public_key(),
            wrapped_key: first.owner_wrap.clone(),
            privilege: Privilege::Owner,
            visible_from_epoch: FIRST_EPOCH_NUMBER,
        })
        .unwrap();

        let epoch_secret = *first.keys.secret_bytes();
        Fixture {
            manager,
            db,
            hubs,
            conversation_id,
            owner: TestMember { account_id: owner_id, keys: owner_keys },
            epoch_secret,
        }
    }

    /// Add a second member sharing the current epoch (wrap included).
    fn join_member(fx: &Fixture, name: &str, privilege: Privilege) -> TestMember {
        let keys = EciesKeyPair::generate();
        let account_id = seed_account(&fx.db, &keys, name);
        seed_member(&fx.db, fx.conversation_id, account_id, privilege);
        fx.db
            .put_wrap(&EpochMemberWrap {
                conversation_id: fx.conversation_id,
                epoch_number: FIRST_EPOCH_NUMBER,
                member_public_key: keys.public_key(),
                wrapped_key: crate::keys::wrap_for_member(&fx.epoch_secret, &keys.public_key())
                    .unwrap(),
                privilege,
                visible_from_epoch: FIRST_EPOCH_NUMBER,
            })
            .unwrap();
        TestMember { account_id, keys }
    }

    /// Queue a removal the way the membership service does: immediate
    /// lockout, pending row, rotation flag.
    fn queue_removal(fx: &Fixture, member: &TestMember) {
        let principal = Principal::Account(member.account_id);
        let mut row = fx.db.get_member(&fx.conversation_id, &principal).unwrap().unwrap();
        row.left_at = Some(NOW);
        fx.db.put_member(&row).unwrap();
        fx.db
            .put_pending_removal(&PendingRemoval {
                conversation_id: fx.conversation_id,
                principal,
                queued_at: NOW,
            })
            .unwrap();
        fx.db
            .update_conversation(&fx.conversation_id, |c| c.rotation_pending = true)
            .unwrap();
    }

    #[tokio::test]
    async fn rotation_advances_epoch_and_prunes_old_wraps() {
        let fx = fixture("happy");
        let removed = join_member(&fx, "mallory", Privilege::Write);
        queue_removal(&fx, &removed);

        let hub = fx.hubs.hub(fx.conversation_id);
        let (_, mut events) = hub.subscribe(veil_broadcast::SubscriberIdentity::Account(
            fx.owner.account_id,
        ));

        let bundle = rotate(&fx.epoch_secret, &[fx.owner.keys.public_key()]).unwrap();
        let new_epoch = fx
            .manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(fx.owner.account_id),
                RotationSubmission {
                    expected_epoch: FIRST_EPOCH_NUMBER,
                    new_epoch_public_key: bundle.new_epoch_public_key,
                    confirmation_hash: bundle.confirmation_hash,
                    member_wraps: bundle.member_wraps.clone(),
                    chain_link: bundle.chain_link.clone(),
                    encrypted_title: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(new_epoch, 2);
        let conv = fx.db.get_conversation(&fx.conversation_id).unwrap().unwrap();
        assert_eq!(conv.current_epoch, 2);
        assert!(!conv.rotation_pending);

        // Old epoch wraps deleted; new epoch covers exactly the owner.
        assert!(fx.db.wraps_for_epoch(&fx.conversation_id, 1).unwrap().is_empty());
        let wraps = fx.db.wraps_for_epoch(&fx.conversation_id, 2).unwrap();
        assert_eq!(wraps.len(), 1);
        assert_eq!(wraps[0].member_public_key, fx.owner.keys.public_key());

        // Removed member has no wrap anywhere and the queue is clear.
        assert!(fx.db.pending_removals(&fx.conversation_id).unwrap().is_empty());
        let removed_row = fx
            .db
            .get_member(&fx.conversation_id, &Principal::Account(removed.account_id))
            .unwrap()
            .unwrap();
        assert!(removed_row.left_at.is_some());

        // Chain traversal from the new epoch reaches the old secret.
        let old = crate::keys::traverse_chain(bundle.keys.secret_bytes(), &bundle.chain_link)
            .unwrap();
        assert_eq!(old, fx.epoch_secret);

        assert!(matches!(
            events.recv().await.unwrap(),
            ChatEvent::RotationComplete { new_epoch_number: 2, .. }
        ));
    }

    #[tokio::test]
    async fn stale_expected_epoch_is_rejected() {
        let fx = fixture("stale");
        let bundle = rotate(&fx.epoch_secret, &[fx.owner.keys.public_key()]).unwrap();
        let err = fx
            .manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(fx.owner.account_id),
                RotationSubmission {
                    expected_epoch: 7,
                    new_epoch_public_key: bundle.new_epoch_public_key,
                    confirmation_hash: bundle.confirmation_hash,
                    member_wraps: bundle.member_wraps,
                    chain_link: bundle.chain_link,
                    encrypted_title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::StaleEpoch { submitted: 7, current: 1 }));
    }

    #[tokio::test]
    async fn wrap_set_must_match_membership_exactly() {
        let fx = fixture("wrapset");
        let bob = join_member(&fx, "bob", Privilege::Write);

        // Missing bob's wrap.
        let incomplete = rotate(&fx.epoch_secret, &[fx.owner.keys.public_key()]).unwrap();
        let err = fx
            .manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(fx.owner.account_id),
                RotationSubmission {
                    expected_epoch: FIRST_EPOCH_NUMBER,
                    new_epoch_public_key: incomplete.new_epoch_public_key,
                    confirmation_hash: incomplete.confirmation_hash,
                    member_wraps: incomplete.member_wraps,
                    chain_link: incomplete.chain_link,
                    encrypted_title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::WrapSetMismatch));

        // Extra wrap for a principal queued for removal.
        queue_removal(&fx, &bob);
        let overfull = rotate(
            &fx.epoch_secret,
            &[fx.owner.keys.public_key(), bob.keys.public_key()],
        )
        .unwrap();
        let err = fx
            .manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(fx.owner.account_id),
                RotationSubmission {
                    expected_epoch: FIRST_EPOCH_NUMBER,
                    new_epoch_public_key: overfull.new_epoch_public_key,
                    confirmation_hash: overfull.confirmation_hash,
                    member_wraps: overfull.member_wraps,
                    chain_link: overfull.chain_link,
                    encrypted_title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::WrapSetMismatch));
    }

    #[tokio::test]
    async fn read_only_member_cannot_rotate() {
        let fx = fixture("privilege");
        let reader = join_member(&fx, "reader", Privilege::Read);
        let bundle = rotate(
            &fx.epoch_secret,
            &[fx.owner.keys.public_key(), reader.keys.public_key()],
        )
        .unwrap();
        let err = fx
            .manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(reader.account_id),
                RotationSubmission {
                    expected_epoch: FIRST_EPOCH_NUMBER,
                    new_epoch_public_key: bundle.new_epoch_public_key,
                    confirmation_hash: bundle.confirmation_hash,
                    member_wraps: bundle.member_wraps,
                    chain_link: bundle.chain_link,
                    encrypted_title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::PrivilegeInsufficient));
    }

    #[tokio::test]
    async fn included_title_is_re_encrypted_to_new_epoch() {
        let fx = fixture("title");
        let bundle = rotate(&fx.epoch_secret, &[fx.owner.keys.public_key()]).unwrap();
        fx.manager
            .submit_rotation(
                fx.conversation_id,
                &Principal::Account(fx.owner.account_id),
                RotationSubmission {
                    expected_epoch: FIRST_EPOCH_NUMBER,
                    new_epoch_public_key: bundle.new_epoch_public_key,
                    confirmation_hash: bundle.confirmation_hash,
                    member_wraps: bundle.member_wraps,
                    chain_link: bundle.chain_link,
                    encrypted_title: Some(vec![9, 9, 9]),
                },
            )
            .await
            .unwrap();
        let conv = fx.db.get_conversation(&fx.conversation_id).unwrap().unwrap();
        assert_eq!(conv.title, Some(vec![9, 9, 9]));
        assert_eq!(conv.title_epoch, 2);
    }
}
