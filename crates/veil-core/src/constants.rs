//! ─── Veil Protocol Constants ────────────────────────────────────────────────
//!
//! Money is fixed-point: 1 USD = 100_000_000 credit units (8 fractional
//! digits). Epoch numbers start at 1 and only ever increase.

use crate::types::Credits;

// ── Money ────────────────────────────────────────────────────────────────────

/// Credit units per dollar (8 fractional digits).
pub const CREDITS_PER_DOLLAR: i128 = 100_000_000;

/// Floor a conversation owner's effective balance may reach while covering
/// group spend. Everyone else stops at zero.
pub const DEFAULT_MAX_NEGATIVE_BALANCE: Credits = -5 * CREDITS_PER_DOLLAR;

/// Daily free-tier allowance the lazy renewal tops balances up to.
pub const DEFAULT_FREE_ALLOWANCE: Credits = CREDITS_PER_DOLLAR / 4; // $0.25

/// One-time signup grant written to the free-tier wallet.
pub const WELCOME_CREDIT: Credits = CREDITS_PER_DOLLAR; // $1.00

/// Source wallet recorded on system-granted ledger entries (welcome credits,
/// renewals, adjustments). Not a real wallet row.
pub const SYSTEM_GRANTS_WALLET: [u8; 32] = [0u8; 32];

// ── Epochs ───────────────────────────────────────────────────────────────────

/// Epoch number of a conversation's first key pair.
pub const FIRST_EPOCH_NUMBER: u64 = 1;

/// Members added without an explicit floor see full history.
pub const DEFAULT_VISIBLE_FROM_EPOCH: u64 = FIRST_EPOCH_NUMBER;

// ── Billing ──────────────────────────────────────────────────────────────────

/// Completion token counts are clamped to at least this before pricing.
pub const MINIMUM_OUTPUT_TOKENS: u64 = 16;

/// Provider surcharge applied on top of raw model pricing when the LLM
/// returned authoritative usage data.
pub const DEFAULT_PROVIDER_FEE_PERCENT: u32 = 15;

/// Rough chars-per-token ratio for the dev/test estimation path.
pub const ESTIMATED_CHARS_PER_TOKEN: u64 = 4;

/// Output-token ceiling assumed when computing the pessimistic reservation.
pub const RESERVATION_OUTPUT_TOKEN_CEILING: u64 = 4096;

/// Reservation keys self-heal after this many seconds if a handler crashes
/// without releasing.
pub const RESERVATION_TTL_SECS: i64 = 300;

// ── Streaming ────────────────────────────────────────────────────────────────

/// Streamed tokens are batched into one `message:stream` event per interval.
pub const STREAM_BATCH_INTERVAL_MS: u64 = 100;

/// Per-read timeout on the LLM token stream.
pub const DEFAULT_LLM_STREAM_TIMEOUT_SECS: u64 = 120;

/// Upper bound on a single message plaintext.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Upper bound on the inference context length (messages, not tokens).
pub const MAX_CONTEXT_MESSAGES: usize = 200;

// ── Link guests ──────────────────────────────────────────────────────────────

/// Per-IP sends per minute for anonymous link guests.
pub const GUEST_SEND_LIMIT_PER_MINUTE: u32 = 6;

/// Per-IP conversation fetches per minute for anonymous link guests.
pub const GUEST_ACCESS_LIMIT_PER_MINUTE: u32 = 30;

/// Window width for the guest rate-limit counters.
pub const GUEST_RATE_WINDOW_SECS: i64 = 60;
