//! Account and money records: accounts, wallets, the append-only ledger, and
//! external payments.
//!
//! Financial rows outlive the account that created them: when an account is
//! deleted its wallets and ledger entries keep existing with the owner
//! reference nulled, so audit sums stay intact.

use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, Credits, PublicKeyBytes, Timestamp, UsageId, WalletId, WalletKind,
};

// ── Account ──────────────────────────────────────────────────────────────────

/// A registered account. The private key never reaches the server in the
/// clear: it is stored twice, wrapped under the password-derived key and under
/// the recovery-phrase-derived key. Both blobs are opaque here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub email: String,
    pub username: String,
    /// Long-term X25519 public key; epoch wraps for this member encrypt to it.
    pub public_key: PublicKeyBytes,
    /// Account private key wrapped under the password-derived key.
    pub password_wrapped_key: Vec<u8>,
    /// Same private key wrapped under the recovery-phrase-derived key.
    pub recovery_wrapped_key: Vec<u8>,
    pub email_verified: bool,
    pub totp_enabled: bool,
    pub recovery_acknowledged: bool,
    pub created_at: Timestamp,
}

// ── Wallet ───────────────────────────────────────────────────────────────────

/// A typed balance container. Debits walk an account's wallets in ascending
/// `priority` order. `owner` is `None` after the owning account is deleted;
/// the row is preserved for the ledger's sake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub owner: Option<AccountId>,
    pub kind: WalletKind,
    pub balance: Credits,
    /// Lower debits first.
    pub priority: u8,
    /// Next ledger index for this wallet (append-only counter).
    pub ledger_seq: u64,
    pub created_at: Timestamp,
}

// ── Ledger ───────────────────────────────────────────────────────────────────

/// Why a ledger entry exists. Exactly one reference per variant; the variant
/// discriminator is the former string `entry_type` column plus its CHECK
/// constraint in one shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LedgerCause {
    /// External purchase confirmed by the payment processor webhook.
    Deposit { payment_id: String },
    /// Debit for a committed AI completion.
    UsageCharge { usage_id: UsageId },
    /// Reversal of a prior usage charge.
    Refund { usage_id: UsageId },
    /// Manual correction, funds notionally moved from another wallet.
    Adjustment { source_wallet: WalletId },
    /// Daily free-tier top-up from the system grants wallet.
    Renewal { source_wallet: WalletId },
    /// One-time signup grant from the system grants wallet.
    WelcomeCredit { source_wallet: WalletId },
}

impl LedgerCause {
    pub fn kind_str(&self) -> &'static str {
        match self {
            LedgerCause::Deposit { .. } => "deposit",
            LedgerCause::UsageCharge { .. } => "usage_charge",
            LedgerCause::Refund { .. } => "refund",
            LedgerCause::Adjustment { .. } => "adjustment",
            LedgerCause::Renewal { .. } => "renewal",
            LedgerCause::WelcomeCredit { .. } => "welcome_credit",
        }
    }
}

/// One immutable balance change. `amount` is signed (negative = debit) and
/// `balance_after` snapshots the wallet balance the moment the entry was
/// appended, so `balance == Σ amount` is auditable per wallet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub wallet_id: WalletId,
    /// Position in the wallet's append-only ledger (0-based).
    pub index: u64,
    pub amount: Credits,
    pub balance_after: Credits,
    pub cause: LedgerCause,
    pub created_at: Timestamp,
}

// ── Payments ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
}

/// An external card transaction as reported by the payment processor. The
/// webhook is idempotent on `payment_id`: once `Confirmed`, further webhooks
/// are acknowledged without touching any balance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Processor-side transaction id (the idempotency key).
    pub payment_id: String,
    pub account_id: Option<AccountId>,
    pub amount: Credits,
    pub status: PaymentStatus,
    pub created_at: Timestamp,
    pub confirmed_at: Option<Timestamp>,
}
