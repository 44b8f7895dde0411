//! Append-only ledger plumbing. Every balance mutation in the system goes
//! through [`apply_balance_change`] so `balance == Σ amounts` holds per
//! wallet at all times.

use veil_core::account::{LedgerCause, LedgerEntry, Wallet};
use veil_core::types::{Credits, Timestamp, WalletId};
use veil_core::VeilError;
use veil_store::StoreDb;

/// Mutate a wallet balance and append the matching ledger entry. The caller
/// holds the owning account's wallet lock; `amount` is signed (negative =
/// debit).
pub fn apply_balance_change(
    db: &StoreDb,
    wallet: &mut Wallet,
    amount: Credits,
    cause: LedgerCause,
    now: Timestamp,
) -> Result<LedgerEntry, VeilError> {
    wallet.balance += amount;
    let entry = LedgerEntry {
        wallet_id: wallet.wallet_id,
        index: wallet.ledger_seq,
        amount,
        balance_after: wallet.balance,
        cause,
        created_at: now,
    };
    wallet.ledger_seq += 1;
    db.append_ledger_entry(&entry)?;
    db.put_wallet(wallet)?;
    Ok(entry)
}

/// Audit one wallet: the entry sum must equal the stored balance and every
/// `balance_after` must match its running sum.
pub fn audit_wallet(db: &StoreDb, wallet_id: &WalletId) -> Result<bool, VeilError> {
    let Some(wallet) = db.get_wallet(wallet_id)? else {
        return Ok(false);
    };
    let mut running: Credits = 0;
    for entry in db.ledger_for_wallet(wallet_id)? {
        running += entry.amount;
        if entry.balance_after != running {
            return Ok(false);
        }
    }
    Ok(running == wallet.balance)
}
