use thiserror::Error;

use crate::types::{Credits, FundingSource};

/// Every failure the core can surface. Each variant maps to a stable wire
/// code and an HTTP status; only storage, serialization, and crypto parse
/// failures are treated as fatal 500s.
#[derive(Debug, Error)]
pub enum VeilError {
    // ── Auth / access ────────────────────────────────────────────────────────
    #[error("not authenticated")]
    NotAuthenticated,

    /// Missing, not a member, or not visible. Never disambiguated.
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("insufficient privilege for this operation")]
    PrivilegeInsufficient,

    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    // ── Billing ──────────────────────────────────────────────────────────────
    #[error("insufficient balance and no alternative payer")]
    PremiumRequiresBalance { current_balance: Credits },

    #[error("balance held by in-flight reservations; retry shortly")]
    BalanceReserved,

    #[error("declared funding source disagrees with server resolution")]
    BillingMismatch { server_source: FundingSource },

    #[error("link guest budget exhausted")]
    BudgetExhausted,

    // ── Epochs / rotation ────────────────────────────────────────────────────
    #[error("conversation has pending removals; rotation required")]
    RotationRequired {
        current_epoch: u64,
        pending_removals: Vec<String>,
    },

    #[error("stale epoch: submitted {submitted}, current {current}")]
    StaleEpoch { submitted: u64, current: u64 },

    #[error("rotation wrap set does not cover the remaining membership")]
    WrapSetMismatch,

    // ── Membership ───────────────────────────────────────────────────────────
    #[error("already an active member")]
    AlreadyMember,

    #[error("the owner cannot be removed")]
    CannotRemoveOwner,

    #[error("self-removal must use the leave operation")]
    CannotRemoveSelf,

    // ── Messaging / stream ───────────────────────────────────────────────────
    #[error("inference context must end with a user message")]
    LastMessageNotUser,

    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("model context length exceeded")]
    ContextLengthExceeded,

    #[error("stream failed: {0}")]
    StreamError(String),

    #[error("stream timed out")]
    StreamTimeout,

    // ── Accounts / wallets / payments ────────────────────────────────────────
    #[error("unknown account: {0}")]
    AccountNotFound(String),

    #[error("email or username already registered")]
    AccountExists,

    #[error("unknown wallet: {0}")]
    WalletNotFound(String),

    #[error("unknown payment transaction: {0}")]
    UnknownPayment(String),

    #[error("webhook signature rejected")]
    WebhookUnauthorized,

    // ── Serialization / storage / crypto ─────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed ciphertext blob: {0}")]
    CryptoParse(String),

    #[error("ciphertext authentication failed")]
    CryptoAuth,

    #[error("{0}")]
    Internal(String),
}

impl VeilError {
    /// Stable machine-actionable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            VeilError::NotAuthenticated => "not-authenticated",
            VeilError::ConversationNotFound => "conversation-not-found",
            VeilError::MessageNotFound => "message-not-found",
            VeilError::PrivilegeInsufficient => "privilege-insufficient",
            VeilError::RateLimited { .. } => "rate-limited",
            VeilError::PremiumRequiresBalance { .. } => "premium-requires-balance",
            VeilError::BalanceReserved => "balance-reserved",
            VeilError::BillingMismatch { .. } => "billing-mismatch",
            VeilError::BudgetExhausted => "budget-exhausted",
            VeilError::RotationRequired { .. } => "rotation-required",
            VeilError::StaleEpoch { .. } => "stale-epoch",
            VeilError::WrapSetMismatch => "wrap-set-mismatch",
            VeilError::AlreadyMember => "already-member",
            VeilError::CannotRemoveOwner => "cannot-remove-owner",
            VeilError::CannotRemoveSelf => "cannot-remove-self",
            VeilError::LastMessageNotUser => "last-message-not-user",
            VeilError::MessageTooLarge { .. } => "message-too-large",
            VeilError::ContextLengthExceeded => "context-length-exceeded",
            VeilError::StreamError(_) | VeilError::StreamTimeout => "stream-error",
            VeilError::AccountNotFound(_) => "account-not-found",
            VeilError::AccountExists => "already-registered",
            VeilError::WalletNotFound(_) => "wallet-not-found",
            VeilError::UnknownPayment(_) => "unknown-payment",
            VeilError::WebhookUnauthorized => "webhook-unauthorized",
            VeilError::Serialization(_)
            | VeilError::Storage(_)
            | VeilError::CryptoParse(_)
            | VeilError::CryptoAuth
            | VeilError::Internal(_) => "internal-error",
        }
    }

    /// HTTP status used when the error surfaces before a stream starts.
    pub fn http_status(&self) -> u16 {
        match self {
            VeilError::NotAuthenticated | VeilError::WebhookUnauthorized => 401,
            VeilError::PremiumRequiresBalance { .. }
            | VeilError::BalanceReserved
            | VeilError::BudgetExhausted => 402,
            VeilError::PrivilegeInsufficient
            | VeilError::CannotRemoveOwner
            | VeilError::CannotRemoveSelf => 403,
            VeilError::ConversationNotFound
            | VeilError::MessageNotFound
            | VeilError::AccountNotFound(_)
            | VeilError::WalletNotFound(_) => 404,
            VeilError::BillingMismatch { .. }
            | VeilError::RotationRequired { .. }
            | VeilError::StaleEpoch { .. }
            | VeilError::AlreadyMember
            | VeilError::AccountExists => 409,
            VeilError::WrapSetMismatch
            | VeilError::LastMessageNotUser
            | VeilError::MessageTooLarge { .. } => 400,
            VeilError::RateLimited { .. } => 429,
            VeilError::ContextLengthExceeded
            | VeilError::StreamError(_)
            | VeilError::StreamTimeout => 502,
            VeilError::UnknownPayment(_)
            | VeilError::Serialization(_)
            | VeilError::Storage(_)
            | VeilError::CryptoParse(_)
            | VeilError::CryptoAuth
            | VeilError::Internal(_) => 500,
        }
    }

    /// Denial takes priority over mismatch: a 402 is never downgraded to 409.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            VeilError::PremiumRequiresBalance { .. }
                | VeilError::BalanceReserved
                | VeilError::BudgetExhausted
        )
    }
}
