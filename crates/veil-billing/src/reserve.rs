//! Speculative reservations. Before a stream starts, its pessimistic max
//! cost is held against every scope it could exhaust (payer balance, member
//! budget, conversation budget) in one atomic check-and-increment; the hold
//! is released when the stream settles. Entries carry a TTL so a crashed
//! handler self-heals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use veil_core::constants::RESERVATION_TTL_SECS;
use veil_core::types::{Credits, Timestamp};
use veil_core::VeilError;

/// One cap the reservation must fit under. `used` is spend already committed
/// against the cap (e.g. a member budget's `spent`).
#[derive(Clone, Debug)]
pub struct ReservationScope {
    pub key: String,
    pub cap: Credits,
    pub used: Credits,
}

/// Handle for releasing a held reservation.
#[derive(Clone, Debug)]
pub struct ReservationTicket {
    id: u64,
    keys: Vec<String>,
    pub amount: Credits,
}

/// The reservation counter seam. The in-process implementation below is the
/// production default; the trait is where a deployment swaps in an external
/// counter store shared across API nodes.
pub trait ReservationStore: Send + Sync {
    /// All-or-nothing: hold `amount` against every scope, or fail
    /// `balance-reserved` having held nothing.
    fn try_reserve(
        &self,
        scopes: &[ReservationScope],
        amount: Credits,
        now: Timestamp,
    ) -> Result<ReservationTicket, VeilError>;

    /// Release a hold (idempotent).
    fn release(&self, ticket: &ReservationTicket);

    /// Live total held against one key.
    fn reserved_total(&self, key: &str, now: Timestamp) -> Credits;
}

struct Held {
    ticket_id: u64,
    amount: Credits,
    expires_at: Timestamp,
}

/// Atomic in-process counter table with per-entry TTL.
pub struct MemoryReservationStore {
    ttl_secs: i64,
    next_id: AtomicU64,
    held: Mutex<HashMap<String, Vec<Held>>>,
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::with_ttl(RESERVATION_TTL_SECS)
    }

    pub fn with_ttl(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            next_id: AtomicU64::new(1),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn live_total(entries: &mut Vec<Held>, now: Timestamp) -> Credits {
        entries.retain(|h| h.expires_at > now);
        entries.iter().map(|h| h.amount).sum()
    }
}

impl Default for MemoryReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore for MemoryReservationStore {
    fn try_reserve(
        &self,
        scopes: &[ReservationScope],
        amount: Credits,
        now: Timestamp,
    ) -> Result<ReservationTicket, VeilError> {
        let mut held = self.held.lock().expect("reservation table poisoned");

        for scope in scopes {
            let entries = held.entry(scope.key.clone()).or_default();
            let outstanding = Self::live_total(entries, now);
            if scope.used + outstanding + amount > scope.cap {
                return Err(VeilError::BalanceReserved);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = now + self.ttl_secs;
        for scope in scopes {
            held.entry(scope.key.clone()).or_default().push(Held {
                ticket_id: id,
                amount,
                expires_at,
            });
        }
        Ok(ReservationTicket {
            id,
            keys: scopes.iter().map(|s| s.key.clone()).collect(),
            amount,
        })
    }

    fn release(&self, ticket: &ReservationTicket) {
        let mut held = self.held.lock().expect("reservation table poisoned");
        for key in &ticket.keys {
            if let Some(entries) = held.get_mut(key) {
                entries.retain(|h| h.ticket_id != ticket.id);
            }
        }
    }

    fn reserved_total(&self, key: &str, now: Timestamp) -> Credits {
        let mut held = self.held.lock().expect("reservation table poisoned");
        held.get_mut(key)
            .map(|entries| Self::live_total(entries, now))
            .unwrap_or(0)
    }
}

// ── Scope key builders ───────────────────────────────────────────────────────

pub fn payer_key(account: &veil_core::types::AccountId) -> String {
    format!("reserve:payer:{account}")
}

pub fn member_key(
    conversation: &veil_core::types::ConversationId,
    principal: &veil_core::types::Principal,
) -> String {
    format!("reserve:member:{conversation}:{}", hex::encode(principal.key_bytes()))
}

pub fn conversation_key(conversation: &veil_core::types::ConversationId) -> String {
    format!("reserve:conversation:{conversation}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(key: &str, cap: Credits, used: Credits) -> ReservationScope {
        ReservationScope { key: key.to_string(), cap, used }
    }

    #[test]
    fn reserve_and_release() {
        let store = MemoryReservationStore::new();
        let ticket = store
            .try_reserve(&[scope("payer:a", 100, 0)], 60, 1000)
            .unwrap();
        assert_eq!(store.reserved_total("payer:a", 1000), 60);

        // Second hold would exceed the cap.
        assert!(matches!(
            store.try_reserve(&[scope("payer:a", 100, 0)], 60, 1000),
            Err(VeilError::BalanceReserved)
        ));

        store.release(&ticket);
        assert_eq!(store.reserved_total("payer:a", 1000), 0);
        assert!(store.try_reserve(&[scope("payer:a", 100, 0)], 60, 1000).is_ok());
    }

    #[test]
    fn multi_scope_is_all_or_nothing() {
        let store = MemoryReservationStore::new();
        // Conversation scope is already nearly full.
        let scopes = [
            scope("member:m", 1000, 0),
            scope("payer:o", 1000, 0),
            scope("conversation:c", 100, 90),
        ];
        assert!(matches!(
            store.try_reserve(&scopes, 50, 0),
            Err(VeilError::BalanceReserved)
        ));
        // Nothing was held on the scopes checked before the failing one.
        assert_eq!(store.reserved_total("member:m", 0), 0);
        assert_eq!(store.reserved_total("payer:o", 0), 0);
    }

    #[test]
    fn committed_spend_counts_against_the_cap() {
        let store = MemoryReservationStore::new();
        assert!(matches!(
            store.try_reserve(&[scope("member:m", 100, 80)], 30, 0),
            Err(VeilError::BalanceReserved)
        ));
        assert!(store.try_reserve(&[scope("member:m", 100, 80)], 20, 0).is_ok());
    }

    #[test]
    fn expired_holds_self_heal() {
        let store = MemoryReservationStore::with_ttl(300);
        let _leaked = store
            .try_reserve(&[scope("payer:a", 100, 0)], 100, 1000)
            .unwrap();
        // Before expiry: blocked. After expiry: the leaked hold is gone.
        assert!(store.try_reserve(&[scope("payer:a", 100, 0)], 10, 1200).is_err());
        assert!(store.try_reserve(&[scope("payer:a", 100, 0)], 10, 1301).is_ok());
    }
}
