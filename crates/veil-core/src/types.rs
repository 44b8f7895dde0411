use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::CREDITS_PER_DOLLAR;

/// Monetary amount in credit units (1 USD = 100_000_000 units, i.e. a
/// fixed-point decimal with 8 fractional digits). Signed: ledger debits are
/// negative, and a conversation owner's wallet may dip below zero down to the
/// configured floor while covering group spend.
pub type Credits = i128;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Per-conversation key-lifetime counter. The first epoch is 1.
pub type EpochNumber = u64;

/// Strictly monotonic per-conversation message ordinal.
pub type SequenceNumber = u64;

/// Raw X25519 public key bytes.
pub type PublicKeyBytes = [u8; 32];

/// Render credit units as a dollar string with at least two decimals
/// (`"10.00"`, `"0.25"`, `"0.00000012"`). Trailing zero sub-cent digits are
/// trimmed.
pub fn credits_to_dollars(c: Credits) -> String {
    let sign = if c < 0 { "-" } else { "" };
    let abs = c.unsigned_abs();
    let whole = abs / CREDITS_PER_DOLLAR as u128;
    let frac = abs % CREDITS_PER_DOLLAR as u128;
    let mut frac_str = format!("{frac:08}");
    while frac_str.len() > 2 && frac_str.ends_with('0') {
        frac_str.pop();
    }
    format!("{sign}{whole}.{frac_str}")
}

/// Parse a dollar string (`"25"`, `"10.5"`, `"0.00000001"`) into credit units.
/// Returns `None` on malformed input or more than 8 fractional digits.
pub fn credits_from_dollars(s: &str) -> Option<Credits> {
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1i128, rest),
        None => (1i128, s),
    };
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 8 {
        return None;
    }
    let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_units: i128 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<8}");
        padded.parse().ok()?
    };
    Some(sign * (whole * CREDITS_PER_DOLLAR + frac_units))
}

// ── AccountId ────────────────────────────────────────────────────────────────

/// 32-byte account identifier derived as BLAKE3(account_public_key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive from an account's X25519 public key.
    pub fn from_public_key(pk: &PublicKeyBytes) -> Self {
        Self(*blake3::hash(pk).as_bytes())
    }

    /// Base-58 encoded string representation.
    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, crate::VeilError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| crate::VeilError::Serialization(format!("bad account id: {e}")))?;
        if bytes.len() != 32 {
            return Err(crate::VeilError::Serialization("bad account id length".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", &self.to_b58()[..8])
    }
}

// ── Opaque 32-byte ids ───────────────────────────────────────────────────────

/// Conversations, messages, wallets, links, usage records, and shares all use
/// 32-byte identifiers rendered as hex. Links derive theirs from the link
/// public key; the rest are random.
macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_bytes(b: [u8; 32]) -> Self {
                Self(b)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn random() -> Self {
                use rand::RngCore;
                let mut b = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut b);
                Self(b)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, crate::VeilError> {
                let bytes = hex::decode(s)
                    .map_err(|e| crate::VeilError::Serialization(format!("bad id: {e}")))?;
                if bytes.len() != 32 {
                    return Err(crate::VeilError::Serialization("bad id length".into()));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}…)", stringify!($name), &self.to_hex()[..8])
            }
        }
    };
}

hex_id! {
    /// Conversation identifier.
    ConversationId
}
hex_id! {
    /// Message identifier. Client-supplied on send so optimistic UI and the
    /// committed row agree.
    MessageId
}
hex_id! {
    /// Wallet identifier.
    WalletId
}
hex_id! {
    /// Shared-link identifier: BLAKE3(link_public_key), so a guest holding the
    /// URL-fragment secret can derive it locally.
    LinkId
}
hex_id! {
    /// Usage-record identifier (per committed AI completion).
    UsageId
}
hex_id! {
    /// Standalone shared-message identifier.
    ShareId
}

impl LinkId {
    pub fn from_public_key(pk: &PublicKeyBytes) -> Self {
        Self(*blake3::hash(pk).as_bytes())
    }
}

// ── Principal ────────────────────────────────────────────────────────────────

/// A conversation participant: exactly one of an account or a shared link.
/// The epoch machinery treats both identically (a link is a virtual member
/// with its own key pair).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Account(AccountId),
    Link(LinkId),
}

impl Principal {
    /// Stable 33-byte key (tag + id) for composed store keys.
    pub fn key_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        match self {
            Principal::Account(id) => {
                out[0] = 0x01;
                out[1..].copy_from_slice(id.as_bytes());
            }
            Principal::Link(id) => {
                out[0] = 0x02;
                out[1..].copy_from_slice(id.as_bytes());
            }
        }
        out
    }

    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Principal::Account(id) => Some(*id),
            Principal::Link(_) => None,
        }
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Account(id) => write!(f, "Principal::Account({id:?})"),
            Principal::Link(id) => write!(f, "Principal::Link({id:?})"),
        }
    }
}

// ── Privilege ────────────────────────────────────────────────────────────────

/// Server-enforced member privilege. Ordering is meaningful: each level
/// includes everything below it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Read,
    Write,
    Admin,
    Owner,
}

impl Privilege {
    pub fn can_send(&self) -> bool {
        *self >= Privilege::Write
    }

    /// Write members may rotate, but only piggybacked on a send.
    pub fn can_rotate(&self) -> bool {
        *self >= Privilege::Write
    }

    pub fn can_add_members(&self) -> bool {
        *self >= Privilege::Admin
    }

    pub fn can_remove_members(&self) -> bool {
        *self >= Privilege::Admin
    }

    pub fn can_manage_links(&self) -> bool {
        *self >= Privilege::Admin
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::Write => "write",
            Privilege::Admin => "admin",
            Privilege::Owner => "owner",
        }
    }
}

// ── Funding source ───────────────────────────────────────────────────────────

/// Client-declared payment origin for a send. The server's resolution is
/// authoritative; a disagreement the server would otherwise allow is a
/// `billing-mismatch`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    PersonalBalance,
    OwnerBalance,
    FreeAllowance,
}

impl FundingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingSource::PersonalBalance => "personal_balance",
            FundingSource::OwnerBalance => "owner_balance",
            FundingSource::FreeAllowance => "free_allowance",
        }
    }
}

// ── Wallet kind / sender type ────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Purchased,
    FreeTier,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Ai,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Ai => "ai",
        }
    }
}
