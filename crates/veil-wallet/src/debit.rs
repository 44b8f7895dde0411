//! The priority-order debit protocol: walk the payer's wallets ascending by
//! priority, debit the first that can cover the amount, and fall back to the
//! negative-balance floor only for a conversation owner covering group spend.

use tracing::info;

use veil_core::account::LedgerCause;
use veil_core::types::{AccountId, Credits, Timestamp, UsageId, WalletId, WalletKind};
use veil_core::VeilError;
use veil_store::StoreDb;

use crate::ledger::apply_balance_change;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebitOutcome {
    pub wallet_id: WalletId,
    pub wallet_kind: WalletKind,
    pub new_balance: Credits,
}

/// Sum of all wallet balances for an account.
pub fn spendable_balance(db: &StoreDb, account: &AccountId) -> Result<Credits, VeilError> {
    Ok(db
        .wallets_for_account(account)?
        .iter()
        .map(|w| w.balance)
        .sum())
}

/// Which wallet kind a debit of `amount` would land on, without mutating.
/// `None` means the debit would be denied. Used for funding-source
/// resolution, so it must mirror [`debit_for_usage`] exactly.
pub fn funding_wallet_kind(
    db: &StoreDb,
    payer: &AccountId,
    amount: Credits,
    negative_floor: Option<Credits>,
) -> Result<Option<WalletKind>, VeilError> {
    let wallets = db.wallets_for_account(payer)?;
    for wallet in &wallets {
        if wallet.balance >= amount {
            return Ok(Some(wallet.kind));
        }
    }
    if let Some(floor) = negative_floor {
        for wallet in &wallets {
            if wallet.kind == WalletKind::Purchased && wallet.balance - amount >= floor {
                return Ok(Some(wallet.kind));
            }
        }
    }
    Ok(None)
}

/// Debit `amount` (positive magnitude) from the payer's wallets for a usage
/// record. `negative_floor` is set only when the payer is the conversation
/// owner covering someone else's spend; only purchased wallets may go below
/// zero, and never below the floor.
///
/// The caller holds the payer's wallet lock for the whole commit.
pub fn debit_for_usage(
    db: &StoreDb,
    payer: &AccountId,
    amount: Credits,
    usage_id: UsageId,
    negative_floor: Option<Credits>,
    now: Timestamp,
) -> Result<DebitOutcome, VeilError> {
    debug_assert!(amount > 0, "debit amount must be a positive magnitude");
    let wallets = db.wallets_for_account(payer)?;

    let chosen = wallets
        .iter()
        .find(|w| w.balance >= amount)
        .or_else(|| {
            negative_floor.and_then(|floor| {
                wallets
                    .iter()
                    .find(|w| w.kind == WalletKind::Purchased && w.balance - amount >= floor)
            })
        });

    let Some(chosen) = chosen else {
        let current_balance = wallets.iter().map(|w| w.balance).sum();
        return Err(VeilError::PremiumRequiresBalance { current_balance });
    };

    let mut wallet = chosen.clone();
    apply_balance_change(
        db,
        &mut wallet,
        -amount,
        LedgerCause::UsageCharge { usage_id },
        now,
    )?;
    info!(
        payer = %payer,
        wallet = %wallet.wallet_id,
        kind = ?wallet.kind,
        amount,
        balance = %wallet.balance,
        "usage debit"
    );
    Ok(DebitOutcome {
        wallet_id: wallet.wallet_id,
        wallet_kind: wallet.kind,
        new_balance: wallet.balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::account::Wallet;
    use veil_core::constants::CREDITS_PER_DOLLAR;

    fn seed_wallet(
        db: &StoreDb,
        owner: AccountId,
        kind: WalletKind,
        priority: u8,
        balance: Credits,
    ) -> WalletId {
        let wallet = Wallet {
            wallet_id: WalletId::random(),
            owner: Some(owner),
            kind,
            balance,
            priority,
            ledger_seq: 0,
            created_at: 0,
        };
        db.put_wallet(&wallet).unwrap();
        wallet.wallet_id
    }

    #[test]
    fn debits_first_sufficient_wallet_by_priority() {
        let db = StoreDb::open_temp("debit_priority").unwrap();
        let payer = AccountId::from_bytes([1; 32]);
        let free = seed_wallet(&db, payer, WalletKind::FreeTier, 0, CREDITS_PER_DOLLAR / 100);
        let purchased = seed_wallet(&db, payer, WalletKind::Purchased, 1, 10 * CREDITS_PER_DOLLAR);

        // Small charge lands on the free wallet.
        let outcome = debit_for_usage(&db, &payer, CREDITS_PER_DOLLAR / 200, UsageId::random(), None, 0)
            .unwrap();
        assert_eq!(outcome.wallet_id, free);

        // A charge the free wallet cannot cover falls through to purchased.
        let outcome = debit_for_usage(&db, &payer, CREDITS_PER_DOLLAR, UsageId::random(), None, 0)
            .unwrap();
        assert_eq!(outcome.wallet_id, purchased);
        assert_eq!(outcome.new_balance, 9 * CREDITS_PER_DOLLAR);
    }

    #[test]
    fn insufficient_funds_reports_total_balance() {
        let db = StoreDb::open_temp("debit_insufficient").unwrap();
        let payer = AccountId::from_bytes([2; 32]);
        seed_wallet(&db, payer, WalletKind::FreeTier, 0, 3);
        seed_wallet(&db, payer, WalletKind::Purchased, 1, 4);

        let err = debit_for_usage(&db, &payer, CREDITS_PER_DOLLAR, UsageId::random(), None, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            VeilError::PremiumRequiresBalance { current_balance: 7 }
        ));
    }

    #[test]
    fn negative_floor_only_for_purchased_wallets() {
        let db = StoreDb::open_temp("debit_floor").unwrap();
        let payer = AccountId::from_bytes([3; 32]);
        seed_wallet(&db, payer, WalletKind::FreeTier, 0, 0);
        let purchased = seed_wallet(&db, payer, WalletKind::Purchased, 1, CREDITS_PER_DOLLAR / 2);

        let floor = -5 * CREDITS_PER_DOLLAR;
        let outcome = debit_for_usage(
            &db,
            &payer,
            2 * CREDITS_PER_DOLLAR,
            UsageId::random(),
            Some(floor),
            0,
        )
        .unwrap();
        assert_eq!(outcome.wallet_id, purchased);
        assert_eq!(outcome.new_balance, CREDITS_PER_DOLLAR / 2 - 2 * CREDITS_PER_DOLLAR);

        // Past the floor even with the override: denied.
        let err = debit_for_usage(
            &db,
            &payer,
            10 * CREDITS_PER_DOLLAR,
            UsageId::random(),
            Some(floor),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, VeilError::PremiumRequiresBalance { .. }));
    }

    #[test]
    fn funding_peek_mirrors_debit() {
        let db = StoreDb::open_temp("debit_peek").unwrap();
        let payer = AccountId::from_bytes([4; 32]);
        seed_wallet(&db, payer, WalletKind::FreeTier, 0, CREDITS_PER_DOLLAR / 100);
        seed_wallet(&db, payer, WalletKind::Purchased, 1, CREDITS_PER_DOLLAR);

        assert_eq!(
            funding_wallet_kind(&db, &payer, CREDITS_PER_DOLLAR / 200, None).unwrap(),
            Some(WalletKind::FreeTier)
        );
        assert_eq!(
            funding_wallet_kind(&db, &payer, CREDITS_PER_DOLLAR / 2, None).unwrap(),
            Some(WalletKind::Purchased)
        );
        assert_eq!(
            funding_wallet_kind(&db, &payer, 2 * CREDITS_PER_DOLLAR, None).unwrap(),
            None
        );
        assert_eq!(
            funding_wallet_kind(
                &db,
                &payer,
                2 * CREDITS_PER_DOLLAR,
                Some(-5 * CREDITS_PER_DOLLAR)
            )
            .unwrap(),
            Some(WalletKind::Purchased)
        );
    }
}
