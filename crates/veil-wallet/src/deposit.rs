//! Payment-processor webhook handling. The webhook is the authoritative
//! credit event; it is idempotent on the processor's transaction id, so the
//! processor can retry freely.

use std::time::Duration;

use tracing::{info, warn};

use veil_core::account::{LedgerCause, Payment, PaymentStatus};
use veil_core::types::{AccountId, Credits, Timestamp, WalletId, WalletKind};
use veil_core::VeilError;
use veil_store::StoreDb;

use crate::ledger::apply_balance_change;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositOutcome {
    Credited { wallet_id: WalletId, new_balance: Credits },
    /// Duplicate webhook for an already-confirmed payment: acknowledged, no
    /// state change.
    AlreadyConfirmed,
}

/// Record a pending payment ahead of the webhook (checkout flow).
pub fn record_pending_payment(
    db: &StoreDb,
    payment_id: &str,
    account_id: AccountId,
    amount: Credits,
    now: Timestamp,
) -> Result<(), VeilError> {
    db.put_payment(&Payment {
        payment_id: payment_id.to_string(),
        account_id: Some(account_id),
        amount,
        status: PaymentStatus::Pending,
        created_at: now,
        confirmed_at: None,
    })
}

/// Apply one webhook delivery. The duplicate check happens before any write:
/// a confirmed payment is acknowledged as-is.
///
/// The caller holds the account's wallet lock.
pub fn apply_payment(
    db: &StoreDb,
    payment_id: &str,
    now: Timestamp,
) -> Result<DepositOutcome, VeilError> {
    let mut payment = db
        .get_payment(payment_id)?
        .ok_or_else(|| VeilError::UnknownPayment(payment_id.to_string()))?;

    if payment.status == PaymentStatus::Confirmed {
        return Ok(DepositOutcome::AlreadyConfirmed);
    }

    let account_id = payment
        .account_id
        .ok_or_else(|| VeilError::UnknownPayment(format!("{payment_id}: no account")))?;

    let mut purchased = db
        .wallets_for_account(&account_id)?
        .into_iter()
        .find(|w| w.kind == WalletKind::Purchased)
        .ok_or_else(|| VeilError::WalletNotFound(account_id.to_b58()))?;

    apply_balance_change(
        db,
        &mut purchased,
        payment.amount,
        LedgerCause::Deposit { payment_id: payment_id.to_string() },
        now,
    )?;

    payment.status = PaymentStatus::Confirmed;
    payment.confirmed_at = Some(now);
    db.put_payment(&payment)?;

    info!(
        payment = payment_id,
        account = %account_id,
        amount = payment.amount,
        "deposit credited"
    );
    Ok(DepositOutcome::Credited {
        wallet_id: purchased.wallet_id,
        new_balance: purchased.balance,
    })
}

/// Webhook entry point: a transaction the processor reports before our
/// checkout record landed is retried a few times before surfacing a 500 (so
/// the processor retries later).
pub async fn apply_payment_with_retry(
    db: &StoreDb,
    payment_id: &str,
    now: Timestamp,
    attempts: u32,
    delay: Duration,
) -> Result<DepositOutcome, VeilError> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match apply_payment(db, payment_id, now) {
            Err(VeilError::UnknownPayment(_)) if attempt + 1 < attempts => {
                warn!(payment = payment_id, attempt, "payment not yet recorded; retrying");
                tokio::time::sleep(delay).await;
                last_err = Some(VeilError::UnknownPayment(payment_id.to_string()));
            }
            other => return other,
        }
    }
    Err(last_err.unwrap_or_else(|| VeilError::UnknownPayment(payment_id.to_string())))
}
