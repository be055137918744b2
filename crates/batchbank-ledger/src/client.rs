use std::sync::Arc;

use thiserror::Error;

use crate::LedgerConfig;

/// Ledger that every account and transfer is booked on.
pub const LEDGER: u32 = 1;
pub const ACCOUNT_CODE: u16 = 1;
pub const TRANSFER_CODE: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerAccount {
    pub id: u128,
    pub ledger: u32,
    pub code: u16,
    pub debits_posted: u128,
    pub credits_posted: u128,
}

impl LedgerAccount {
    pub fn new(id: u128) -> Self {
        Self {
            id,
            ledger: LEDGER,
            code: ACCOUNT_CODE,
            debits_posted: 0,
            credits_posted: 0,
        }
    }

    pub fn net_credit(&self) -> i128 {
        self.credits_posted as i128 - self.debits_posted as i128
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub id: u128,
    pub debit_account_id: u128,
    pub credit_account_id: u128,
    pub amount: u128,
    pub ledger: u32,
    pub code: u16,
}

impl Transfer {
    pub fn new(id: u128, debit_account_id: u128, credit_account_id: u128, amount: u128) -> Self {
        Self {
            id,
            debit_account_id,
            credit_account_id,
            amount,
            ledger: LEDGER,
            code: TRANSFER_CODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateAccountError {
    #[error("account already exists")]
    Exists,
    #[error("account id must not be zero")]
    IdMustNotBeZero,
    #[error("ledger must not be zero")]
    LedgerMustNotBeZero,
    /// Any other result code reported by the service.
    #[error("account rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateTransferError {
    #[error("transfer already exists")]
    Exists,
    #[error("transfer id must not be zero")]
    IdMustNotBeZero,
    #[error("debit account not found")]
    DebitAccountNotFound,
    #[error("credit account not found")]
    CreditAccountNotFound,
    #[error("accounts must be different")]
    AccountsMustBeDifferent,
    #[error("amount must not be zero")]
    AmountMustNotBeZero,
    #[error("transfer ledger does not match account ledger")]
    LedgerMismatch,
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// Failure of the request itself, as opposed to a rejected item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger service unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Client for a double-entry ledger service.
///
/// Batch calls return only the rejected items, as `(index, reason)` pairs.
/// Each item is applied on its own; there is no cross-item atomicity.
pub trait LedgerClient: Send + Sync {
    fn lookup_accounts(&self, ids: &[u128]) -> Result<Vec<LedgerAccount>, LedgerError>;
    fn create_accounts(&self, accounts: &[LedgerAccount]) -> Result<Vec<(usize, CreateAccountError)>, LedgerError>;
    fn create_transfers(&self, transfers: &[Transfer]) -> Result<Vec<(usize, CreateTransferError)>, LedgerError>;
}

pub trait LedgerConnector: Send + Sync {
    fn connect(&self, config: &LedgerConfig) -> Result<Arc<dyn LedgerClient>, LedgerError>;
}
