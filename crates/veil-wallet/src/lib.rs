pub mod debit;
pub mod deposit;
pub mod ledger;
pub mod provision;
pub mod renewal;

pub use debit::{debit_for_usage, funding_wallet_kind, spendable_balance, DebitOutcome};
pub use deposit::{apply_payment, apply_payment_with_retry, record_pending_payment, DepositOutcome};
pub use ledger::{apply_balance_change, audit_wallet};
pub use provision::{register_account, NewAccount, ProvisionedAccount};
pub use renewal::ensure_free_tier_current;
