//! Signup provisioning: the account row (with both wrapped-key blobs), its
//! two wallets, and the welcome credit.

use tracing::info;

use veil_core::account::{Account, LedgerCause, Wallet};
use veil_core::constants::SYSTEM_GRANTS_WALLET;
use veil_core::types::{AccountId, Credits, PublicKeyBytes, Timestamp, WalletId, WalletKind};
use veil_core::VeilError;
use veil_store::StoreDb;

use crate::ledger::apply_balance_change;

/// Free tier debits ahead of purchased funds.
const FREE_TIER_PRIORITY: u8 = 0;
const PURCHASED_PRIORITY: u8 = 1;

pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub public_key: PublicKeyBytes,
    pub password_wrapped_key: Vec<u8>,
    pub recovery_wrapped_key: Vec<u8>,
}

pub struct ProvisionedAccount {
    pub account: Account,
    pub purchased_wallet: WalletId,
    pub free_wallet: WalletId,
}

/// Create an account with its purchased and free-tier wallets and write the
/// welcome credit. Email and username must be unused.
pub fn register_account(
    db: &StoreDb,
    new: NewAccount,
    welcome_credit: Credits,
    now: Timestamp,
) -> Result<ProvisionedAccount, VeilError> {
    if db.account_id_by_email(&new.email)?.is_some()
        || db.account_id_by_username(&new.username)?.is_some()
    {
        return Err(VeilError::AccountExists);
    }

    let account = Account {
        account_id: AccountId::from_public_key(&new.public_key),
        email: new.email,
        username: new.username,
        public_key: new.public_key,
        password_wrapped_key: new.password_wrapped_key,
        recovery_wrapped_key: new.recovery_wrapped_key,
        email_verified: false,
        totp_enabled: false,
        recovery_acknowledged: false,
        created_at: now,
    };
    db.put_account(&account)?;

    let purchased = Wallet {
        wallet_id: WalletId::random(),
        owner: Some(account.account_id),
        kind: WalletKind::Purchased,
        balance: 0,
        priority: PURCHASED_PRIORITY,
        ledger_seq: 0,
        created_at: now,
    };
    db.put_wallet(&purchased)?;

    let mut free = Wallet {
        wallet_id: WalletId::random(),
        owner: Some(account.account_id),
        kind: WalletKind::FreeTier,
        balance: 0,
        priority: FREE_TIER_PRIORITY,
        ledger_seq: 0,
        created_at: now,
    };
    db.put_wallet(&free)?;
    if welcome_credit > 0 {
        apply_balance_change(
            db,
            &mut free,
            welcome_credit,
            LedgerCause::WelcomeCredit {
                source_wallet: WalletId::from_bytes(SYSTEM_GRANTS_WALLET),
            },
            now,
        )?;
    }

    info!(account = %account.account_id, username = %account.username, "account provisioned");
    Ok(ProvisionedAccount {
        purchased_wallet: purchased.wallet_id,
        free_wallet: free.wallet_id,
        account,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::constants::WELCOME_CREDIT;

    fn new_account(tag: u8) -> NewAccount {
        NewAccount {
            email: format!("user{tag}@example.com"),
            username: format!("user{tag}"),
            public_key: [tag; 32],
            password_wrapped_key: vec![1; 49],
            recovery_wrapped_key: vec![2; 49],
        }
    }

    #[test]
    fn provisions_two_wallets_and_welcome_credit() {
        let db = StoreDb::open_temp("provision").unwrap();
        let provisioned = register_account(&db, new_account(1), WELCOME_CREDIT, 0).unwrap();

        let wallets = db.wallets_for_account(&provisioned.account.account_id).unwrap();
        assert_eq!(wallets.len(), 2);
        assert_eq!(wallets[0].kind, WalletKind::FreeTier);
        assert_eq!(wallets[0].balance, WELCOME_CREDIT);
        assert_eq!(wallets[1].kind, WalletKind::Purchased);
        assert_eq!(wallets[1].balance, 0);

        let entries = db.ledger_for_wallet(&provisioned.free_wallet).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].cause, LedgerCause::WelcomeCredit { .. }));
    }

    #[test]
    fn duplicate_email_or_username_rejected() {
        let db = StoreDb::open_temp("provision_dup").unwrap();
        register_account(&db, new_account(1), 0, 0).unwrap();

        let mut dup_email = new_account(2);
        dup_email.email = "user1@example.com".into();
        assert!(matches!(
            register_account(&db, dup_email, 0, 0),
            Err(VeilError::AccountExists)
        ));

        let mut dup_username = new_account(3);
        dup_username.username = "user1".into();
        assert!(matches!(
            register_account(&db, dup_username, 0, 0),
            Err(VeilError::AccountExists)
        ));
    }
}
