use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;

use veil_core::types::AccountId;
use veil_core::VeilError;

/// Session-token shim. The real identity stack (OPAQUE, TOTP, cookies) lives
/// upstream; the core only needs token → account resolution. Tokens are
/// minted at registration and on whatever login flow the gateway runs.
pub struct SessionRegistry {
    tokens: Mutex<HashMap<String, AccountId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh opaque token for an account.
    pub fn issue(&self, account_id: AccountId) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.tokens
            .lock()
            .expect("session table poisoned")
            .insert(token.clone(), account_id);
        token
    }

    pub fn resolve(&self, token: &str) -> Result<AccountId, VeilError> {
        self.tokens
            .lock()
            .expect("session table poisoned")
            .get(token)
            .copied()
            .ok_or(VeilError::NotAuthenticated)
    }

    /// Drop every session for an account (logout-everywhere, deletion).
    pub fn revoke_account(&self, account_id: &AccountId) {
        self.tokens
            .lock()
            .expect("session table poisoned")
            .retain(|_, a| a != account_id);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
