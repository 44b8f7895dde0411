//! Conversation records: the conversation row itself, epochs and their member
//! wraps, members, shared links, budgets, and the pending-removal queue.

use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, ConversationId, Credits, EpochNumber, LinkId, Principal, Privilege,
    PublicKeyBytes, SequenceNumber, Timestamp,
};

// ── Conversation ─────────────────────────────────────────────────────────────

/// One group conversation. `current_epoch` and `next_sequence` are the two
/// monotonic counters everything else hangs off; `rotation_pending` is the
/// lazy-rotation marker set by removals and cleared by the next rotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub owner: AccountId,
    pub current_epoch: EpochNumber,
    pub next_sequence: SequenceNumber,
    pub rotation_pending: bool,
    /// Default owner-covered budget per non-owner member. `None` = no default.
    pub per_person_budget: Option<Credits>,
    /// Cap on total owner-covered spend across the conversation.
    pub conversation_budget: Option<Credits>,
    /// Title ciphertext, encrypted under `title_epoch`'s public key.
    pub title: Option<Vec<u8>>,
    pub title_epoch: EpochNumber,
    pub created_at: Timestamp,
}

// ── Epoch ────────────────────────────────────────────────────────────────────

/// One key-pair period in a conversation's lifetime. The private key only
/// ever exists server-side inside member wraps; `confirmation_hash` =
/// BLAKE3(private key) lets clients validate an unwrap cheaply before trying
/// message decryption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub conversation_id: ConversationId,
    pub epoch_number: EpochNumber,
    pub public_key: PublicKeyBytes,
    pub confirmation_hash: [u8; 32],
    /// `ECIES(this epoch's public key, previous epoch's private key)`.
    /// `None` for the first epoch.
    pub chain_link: Option<Vec<u8>>,
    pub created_at: Timestamp,
}

/// The epoch private key wrapped for one member or link public key. Wraps
/// exist only for the current epoch (older epochs are reachable through chain
/// links), which keeps storage bounded by membership size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMemberWrap {
    pub conversation_id: ConversationId,
    pub epoch_number: EpochNumber,
    /// The wrap target's public key (account or link).
    pub member_public_key: PublicKeyBytes,
    /// `ECIES(member_public_key, epoch private key)`.
    pub wrapped_key: Vec<u8>,
    /// Replicated from the member row at wrap time.
    pub privilege: Privilege,
    pub visible_from_epoch: EpochNumber,
}

// ── Members ──────────────────────────────────────────────────────────────────

/// A conversation participant row. `left_at` doubles as the server-side
/// lockout switch: set the moment a removal is queued, long before keys
/// rotate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: ConversationId,
    pub principal: Principal,
    pub privilege: Privilege,
    /// Server-enforced floor on fetchable history.
    pub visible_from_epoch: EpochNumber,
    pub joined_at: Timestamp,
    pub left_at: Option<Timestamp>,
}

impl ConversationMember {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// An anonymous-access link: a virtual member whose key pair is derived from
/// a secret carried in the URL fragment. Indistinguishable from an account
/// member to the epoch machinery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedLink {
    pub link_id: LinkId,
    pub conversation_id: ConversationId,
    pub public_key: PublicKeyBytes,
    /// Links are `read` or `write`, never admin.
    pub privilege: Privilege,
    pub visible_from_epoch: EpochNumber,
    pub created_at: Timestamp,
    pub revoked_at: Option<Timestamp>,
}

impl SharedLink {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

// ── Budgets / spending ───────────────────────────────────────────────────────

/// Owner-granted budget for one member. Absent row = zero budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberBudget {
    pub conversation_id: ConversationId,
    pub account_id: AccountId,
    pub budget: Credits,
    pub spent: Credits,
}

/// Total owner-covered spend for a conversation. Incremented only when the
/// owner pays on behalf of a non-owner; the owner's own sends never touch it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSpending {
    pub conversation_id: ConversationId,
    pub total_spent: Credits,
}

// ── Pending removals ─────────────────────────────────────────────────────────

/// A queued removal applied by the next rotation. Several queued removals
/// collapse into one rotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRemoval {
    pub conversation_id: ConversationId,
    pub principal: Principal,
    pub queued_at: Timestamp,
}
