//! Payer resolution for a send in conversation C owned by O from sender S:
//! the owner pays for their own sends; non-owners ride the owner's group
//! budget while it lasts, then fall back to their own wallets; anonymous
//! link guests have nothing to fall back to.

use veil_core::conversation::{Conversation, ConversationSpending, MemberBudget};
use veil_core::types::{
    AccountId, ConversationId, Credits, FundingSource, LinkId, Principal, Timestamp, WalletKind,
};
use veil_core::VeilError;
use veil_store::StoreDb;
use veil_wallet::{ensure_free_tier_current, funding_wallet_kind, spendable_balance};

/// Who is asking to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendPrincipal {
    Account(AccountId),
    LinkGuest(LinkId),
}

impl SendPrincipal {
    pub fn principal(&self) -> Principal {
        match self {
            SendPrincipal::Account(id) => Principal::Account(*id),
            SendPrincipal::LinkGuest(id) => Principal::Link(*id),
        }
    }

    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            SendPrincipal::Account(id) => Some(*id),
            SendPrincipal::LinkGuest(_) => None,
        }
    }
}

/// Budget rows are keyed by account; a link guest's spend is tracked under a
/// pseudo-account carrying the link id bytes.
pub fn budget_key_account(sender: &SendPrincipal) -> AccountId {
    match sender {
        SendPrincipal::Account(id) => *id,
        SendPrincipal::LinkGuest(link) => AccountId::from_bytes(*link.as_bytes()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayerKind {
    /// Sender is the owner paying for themselves.
    OwnerSelf,
    /// Owner covers a non-owner's send out of the group budget.
    OwnerCovers,
    /// Authenticated sender pays from their own wallets.
    SenderPays,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayerDecision {
    pub payer: AccountId,
    pub kind: PayerKind,
    pub funding_source: FundingSource,
    /// Negative-balance floor granted to the debit; only set when the owner
    /// covers someone else's spend.
    pub negative_floor: Option<Credits>,
}

fn source_for_wallet(kind: WalletKind) -> FundingSource {
    match kind {
        WalletKind::Purchased => FundingSource::PersonalBalance,
        WalletKind::FreeTier => FundingSource::FreeAllowance,
    }
}

/// Resolve the payer for an estimated charge of `estimated_cost`. Runs the
/// lazy free-tier renewal on any account whose wallets are considered, and
/// denies (`premium-requires-balance` / `budget-exhausted`) when no payer
/// could cover the estimate.
pub fn resolve_payer(
    db: &StoreDb,
    conv: &Conversation,
    sender: &SendPrincipal,
    estimated_cost: Credits,
    free_allowance: Credits,
    negative_floor: Credits,
    now: Timestamp,
) -> Result<PayerDecision, VeilError> {
    // Owner sends on their own dime, floor never applies.
    if sender.account_id() == Some(conv.owner) {
        ensure_free_tier_current(db, &conv.owner, free_allowance, now)?;
        let Some(kind) = funding_wallet_kind(db, &conv.owner, estimated_cost, None)? else {
            return Err(VeilError::PremiumRequiresBalance {
                current_balance: spendable_balance(db, &conv.owner)?,
            });
        };
        return Ok(PayerDecision {
            payer: conv.owner,
            kind: PayerKind::OwnerSelf,
            funding_source: source_for_wallet(kind),
            negative_floor: None,
        });
    }

    let budget_account = budget_key_account(sender);
    let member_budget = db.get_member_budget(&conv.conversation_id, &budget_account)?;
    let budget = conv
        .per_person_budget
        .or(member_budget.as_ref().map(|b| b.budget))
        .unwrap_or(0);
    let spent = member_budget.as_ref().map(|b| b.spent).unwrap_or(0);
    let total_spent = db
        .get_spending(&conv.conversation_id)?
        .map(|s| s.total_spent)
        .unwrap_or(0);
    let under_conv_cap = conv.conversation_budget.is_none_or(|cap| total_spent < cap);

    if budget > spent && under_conv_cap {
        ensure_free_tier_current(db, &conv.owner, free_allowance, now)?;
        if funding_wallet_kind(db, &conv.owner, estimated_cost, Some(negative_floor))?.is_none() {
            return Err(VeilError::PremiumRequiresBalance {
                current_balance: spendable_balance(db, &conv.owner)?,
            });
        }
        return Ok(PayerDecision {
            payer: conv.owner,
            kind: PayerKind::OwnerCovers,
            funding_source: FundingSource::OwnerBalance,
            negative_floor: Some(negative_floor),
        });
    }

    if let Some(sender_account) = sender.account_id() {
        ensure_free_tier_current(db, &sender_account, free_allowance, now)?;
        let Some(kind) = funding_wallet_kind(db, &sender_account, estimated_cost, None)? else {
            return Err(VeilError::PremiumRequiresBalance {
                current_balance: spendable_balance(db, &sender_account)?,
            });
        };
        return Ok(PayerDecision {
            payer: sender_account,
            kind: PayerKind::SenderPays,
            funding_source: source_for_wallet(kind),
            negative_floor: None,
        });
    }

    // Link guest with nothing left on the owner's budget.
    Err(VeilError::BudgetExhausted)
}

/// Client/server funding agreement. Call only after [`resolve_payer`]
/// succeeded: a denial always outranks a mismatch.
pub fn check_funding_agreement(
    decision: &PayerDecision,
    declared: FundingSource,
) -> Result<(), VeilError> {
    if declared != decision.funding_source {
        return Err(VeilError::BillingMismatch {
            server_source: decision.funding_source,
        });
    }
    Ok(())
}

/// Commit-side bookkeeping when the owner covered a non-owner's send. The
/// caller holds the owner's wallet lock, which serializes these increments.
pub fn record_covered_spend(
    db: &StoreDb,
    conversation_id: &ConversationId,
    sender: &SendPrincipal,
    cost: Credits,
) -> Result<(), VeilError> {
    let budget_account = budget_key_account(sender);
    let mut budget = db
        .get_member_budget(conversation_id, &budget_account)?
        .unwrap_or(MemberBudget {
            conversation_id: *conversation_id,
            account_id: budget_account,
            budget: 0,
            spent: 0,
        });
    budget.spent += cost;
    db.put_member_budget(&budget)?;

    let mut spending = db
        .get_spending(conversation_id)?
        .unwrap_or(ConversationSpending {
            conversation_id: *conversation_id,
            total_spent: 0,
        });
    spending.total_spent += cost;
    db.put_spending(&spending)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::account::Wallet;
    use veil_core::constants::{CREDITS_PER_DOLLAR, DEFAULT_MAX_NEGATIVE_BALANCE};
    use veil_core::types::WalletId;

    const NOW: i64 = 1_700_000_000;
    const EST: Credits = CREDITS_PER_DOLLAR / 10;

    fn seed_wallet(db: &StoreDb, owner: AccountId, kind: WalletKind, priority: u8, balance: Credits) {
        db.put_wallet(&Wallet {
            wallet_id: WalletId::random(),
            owner: Some(owner),
            kind,
            balance,
            priority,
            ledger_seq: 0,
            created_at: 0,
        })
        .unwrap();
    }

    fn conversation(owner: AccountId) -> Conversation {
        Conversation {
            conversation_id: ConversationId::random(),
            owner,
            current_epoch: 1,
            next_sequence: 1,
            rotation_pending: false,
            per_person_budget: None,
            conversation_budget: None,
            title: None,
            title_epoch: 1,
            created_at: NOW,
        }
    }

    #[test]
    fn owner_pays_personally_without_touching_group_spend() {
        let db = StoreDb::open_temp("payer_owner").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let conv = conversation(owner);

        let decision = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(owner),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap();
        assert_eq!(decision.payer, owner);
        assert_eq!(decision.kind, PayerKind::OwnerSelf);
        assert_eq!(decision.funding_source, FundingSource::PersonalBalance);
        assert_eq!(decision.negative_floor, None);
    }

    #[test]
    fn zero_balance_owner_is_denied_before_any_mismatch_check() {
        let db = StoreDb::open_temp("payer_denied").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 0);
        let conv = conversation(owner);

        let err = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(owner),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            VeilError::PremiumRequiresBalance { current_balance: 0 }
        ));
        assert!(err.is_denial());
    }

    #[test]
    fn member_with_budget_rides_owner_balance() {
        let db = StoreDb::open_temp("payer_covered").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        let member = AccountId::from_bytes([2; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let mut conv = conversation(owner);
        conv.per_person_budget = Some(5 * CREDITS_PER_DOLLAR);

        let decision = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(member),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap();
        assert_eq!(decision.payer, owner);
        assert_eq!(decision.kind, PayerKind::OwnerCovers);
        assert_eq!(decision.funding_source, FundingSource::OwnerBalance);
        assert_eq!(decision.negative_floor, Some(DEFAULT_MAX_NEGATIVE_BALANCE));
    }

    #[test]
    fn exhausted_budget_falls_back_to_sender_wallets() {
        let db = StoreDb::open_temp("payer_fallback").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        let member = AccountId::from_bytes([2; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        seed_wallet(&db, member, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let conv = conversation(owner);

        // Member budget fully spent.
        db.put_member_budget(&MemberBudget {
            conversation_id: conv.conversation_id,
            account_id: member,
            budget: 50 * CREDITS_PER_DOLLAR,
            spent: 50 * CREDITS_PER_DOLLAR,
        })
        .unwrap();

        let decision = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(member),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap();
        assert_eq!(decision.payer, member);
        assert_eq!(decision.kind, PayerKind::SenderPays);
        assert_eq!(decision.negative_floor, None);
    }

    #[test]
    fn conversation_cap_blocks_owner_coverage() {
        let db = StoreDb::open_temp("payer_conv_cap").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        let member = AccountId::from_bytes([2; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        seed_wallet(&db, member, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let mut conv = conversation(owner);
        conv.per_person_budget = Some(5 * CREDITS_PER_DOLLAR);
        conv.conversation_budget = Some(CREDITS_PER_DOLLAR);
        db.put_spending(&ConversationSpending {
            conversation_id: conv.conversation_id,
            total_spent: CREDITS_PER_DOLLAR,
        })
        .unwrap();

        let decision = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(member),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap();
        assert_eq!(decision.kind, PayerKind::SenderPays);
    }

    #[test]
    fn guest_with_no_budget_left_is_rejected() {
        let db = StoreDb::open_temp("payer_guest").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let conv = conversation(owner);

        let err = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::LinkGuest(LinkId::from_bytes([7; 32])),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap_err();
        assert!(matches!(err, VeilError::BudgetExhausted));
    }

    #[test]
    fn mismatch_only_after_resolution_allows() {
        let db = StoreDb::open_temp("payer_mismatch").unwrap();
        let owner = AccountId::from_bytes([1; 32]);
        seed_wallet(&db, owner, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);
        let conv = conversation(owner);

        let decision = resolve_payer(
            &db,
            &conv,
            &SendPrincipal::Account(owner),
            EST,
            0,
            DEFAULT_MAX_NEGATIVE_BALANCE,
            NOW,
        )
        .unwrap();
        let err = check_funding_agreement(&decision, FundingSource::FreeAllowance).unwrap_err();
        assert!(matches!(
            err,
            VeilError::BillingMismatch { server_source: FundingSource::PersonalBalance }
        ));
    }

    #[test]
    fn covered_spend_bookkeeping() {
        let db = StoreDb::open_temp("payer_record").unwrap();
        let conv_id = ConversationId::random();
        let member = SendPrincipal::Account(AccountId::from_bytes([2; 32]));

        record_covered_spend(&db, &conv_id, &member, 100).unwrap();
        record_covered_spend(&db, &conv_id, &member, 50).unwrap();

        let budget = db
            .get_member_budget(&conv_id, &budget_key_account(&member))
            .unwrap()
            .unwrap();
        assert_eq!(budget.spent, 150);
        assert_eq!(db.get_spending(&conv_id).unwrap().unwrap().total_spent, 150);
    }
}
