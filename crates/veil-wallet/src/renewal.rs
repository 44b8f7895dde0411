//! Lazy free-tier renewal. No scheduler: the first balance read after UTC
//! midnight tops the free wallet back up to the allowance and records a
//! `renewal` ledger entry. The `balance < allowance` guard keeps concurrent
//! reads from double-topping.

use tracing::debug;

use veil_core::account::LedgerCause;
use veil_core::constants::SYSTEM_GRANTS_WALLET;
use veil_core::types::{AccountId, Credits, Timestamp, WalletId, WalletKind};
use veil_core::VeilError;
use veil_store::StoreDb;

use crate::ledger::apply_balance_change;

fn utc_midnight(now: Timestamp) -> Timestamp {
    now - now.rem_euclid(86_400)
}

/// Bring the account's free-tier wallet up to `allowance` if no renewal has
/// happened since today's UTC midnight. Called on every balance read and at
/// the top of payer resolution; the caller holds the account's wallet lock.
pub fn ensure_free_tier_current(
    db: &StoreDb,
    account: &AccountId,
    allowance: Credits,
    now: Timestamp,
) -> Result<(), VeilError> {
    let midnight = utc_midnight(now);
    for wallet in db.wallets_for_account(account)? {
        if wallet.kind != WalletKind::FreeTier {
            continue;
        }
        let last = db.last_renewal_at(&wallet.wallet_id)?;
        if last.is_some_and(|t| t >= midnight) {
            continue;
        }
        if wallet.balance >= allowance {
            continue;
        }
        let mut wallet = wallet;
        let delta = allowance - wallet.balance;
        apply_balance_change(
            db,
            &mut wallet,
            delta,
            LedgerCause::Renewal {
                source_wallet: WalletId::from_bytes(SYSTEM_GRANTS_WALLET),
            },
            now,
        )?;
        debug!(account = %account, wallet = %wallet.wallet_id, delta, "free tier renewed");
    }
    Ok(())
}
