use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    client::{CreateAccountError, CreateTransferError, LedgerAccount, LedgerClient, LedgerConnector, LedgerError, Transfer},
    LedgerConfig,
};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<u128, LedgerAccount>,
    transfers: HashSet<u128>,
    fail_after: Option<usize>,
}

/// An in-process ledger service applying the same acceptance rules as the
/// remote one. Clones share state, so a test can keep a handle while the
/// store owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts `n` more transfers, then fails the next `create_transfers`
    /// request as unavailable. One-shot.
    pub fn fail_transfers_after(&self, n: usize) {
        self.state().fail_after = Some(n);
    }

    pub fn transfer_count(&self) -> usize {
        self.state().transfers.len()
    }

    pub fn account(&self, id: u128) -> Option<LedgerAccount> {
        self.state().accounts.get(&id).copied()
    }
}

impl LedgerState {
    fn create_transfer(&mut self, transfer: &Transfer) -> Result<(), CreateTransferError> {
        if transfer.id == 0 {
            return Err(CreateTransferError::IdMustNotBeZero);
        }
        if self.transfers.contains(&transfer.id) {
            return Err(CreateTransferError::Exists);
        }
        if transfer.debit_account_id == transfer.credit_account_id {
            return Err(CreateTransferError::AccountsMustBeDifferent);
        }
        if transfer.amount == 0 {
            return Err(CreateTransferError::AmountMustNotBeZero);
        }
        let debit = self
            .accounts
            .get(&transfer.debit_account_id)
            .ok_or(CreateTransferError::DebitAccountNotFound)?;
        let credit = self
            .accounts
            .get(&transfer.credit_account_id)
            .ok_or(CreateTransferError::CreditAccountNotFound)?;
        if debit.ledger != transfer.ledger || credit.ledger != transfer.ledger {
            return Err(CreateTransferError::LedgerMismatch);
        }

        if let Some(debit) = self.accounts.get_mut(&transfer.debit_account_id) {
            debit.debits_posted += transfer.amount;
        }
        if let Some(credit) = self.accounts.get_mut(&transfer.credit_account_id) {
            credit.credits_posted += transfer.amount;
        }
        self.transfers.insert(transfer.id);
        Ok(())
    }
}

impl LedgerClient for MemoryLedger {
    fn lookup_accounts(&self, ids: &[u128]) -> Result<Vec<LedgerAccount>, LedgerError> {
        let state = self.state();
        Ok(ids.iter().filter_map(|id| state.accounts.get(id).copied()).collect())
    }

    fn create_accounts(&self, accounts: &[LedgerAccount]) -> Result<Vec<(usize, CreateAccountError)>, LedgerError> {
        let mut state = self.state();
        let mut failures = Vec::new();
        for (index, account) in accounts.iter().enumerate() {
            let rejected = if account.id == 0 {
                Some(CreateAccountError::IdMustNotBeZero)
            } else if account.ledger == 0 {
                Some(CreateAccountError::LedgerMustNotBeZero)
            } else if state.accounts.contains_key(&account.id) {
                Some(CreateAccountError::Exists)
            } else {
                None
            };
            match rejected {
                Some(reason) => failures.push((index, reason)),
                None => {
                    state.accounts.insert(account.id, LedgerAccount {
                        debits_posted: 0,
                        credits_posted: 0,
                        ..*account
                    });
                }
            }
        }
        Ok(failures)
    }

    fn create_transfers(&self, transfers: &[Transfer]) -> Result<Vec<(usize, CreateTransferError)>, LedgerError> {
        let mut state = self.state();
        let mut failures = Vec::new();
        for (index, transfer) in transfers.iter().enumerate() {
            match state.fail_after {
                Some(0) => {
                    state.fail_after = None;
                    return Err(LedgerError::Unavailable("injected failure".to_string()));
                }
                Some(n) => state.fail_after = Some(n - 1),
                None => {}
            }
            if let Err(reason) = state.create_transfer(transfer) {
                failures.push((index, reason));
            }
        }
        Ok(failures)
    }
}

impl LedgerConnector for MemoryLedger {
    fn connect(&self, _config: &LedgerConfig) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(ids: &[u128]) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        let accounts: Vec<_> = ids.iter().map(|id| LedgerAccount::new(*id)).collect();
        assert!(ledger.create_accounts(&accounts).unwrap().is_empty());
        ledger
    }

    #[test]
    fn test_transfer_posts_both_sides() {
        let ledger = ledger_with(&[1, 2]);
        let failures = ledger.create_transfers(&[Transfer::new(10, 1, 2, 25)]).unwrap();
        assert!(failures.is_empty());
        assert_eq!(ledger.account(1).unwrap().net_credit(), -25);
        assert_eq!(ledger.account(2).unwrap().net_credit(), 25);
    }

    #[test]
    fn test_rejections_are_reported_per_item() {
        let ledger = ledger_with(&[1, 2]);
        let failures = ledger
            .create_transfers(&[
                Transfer::new(10, 1, 2, 5),
                Transfer::new(10, 1, 2, 5),
                Transfer::new(11, 1, 9, 5),
                Transfer::new(12, 1, 2, 0),
                Transfer::new(13, 2, 2, 1),
            ])
            .unwrap();
        assert_eq!(failures, vec![
            (1, CreateTransferError::Exists),
            (2, CreateTransferError::CreditAccountNotFound),
            (3, CreateTransferError::AmountMustNotBeZero),
            (4, CreateTransferError::AccountsMustBeDifferent),
        ]);
        assert_eq!(ledger.transfer_count(), 1);
    }

    #[test]
    fn test_duplicate_account_is_rejected() {
        let ledger = ledger_with(&[1]);
        let failures = ledger.create_accounts(&[LedgerAccount::new(1), LedgerAccount::new(0)]).unwrap();
        assert_eq!(failures, vec![(0, CreateAccountError::Exists), (1, CreateAccountError::IdMustNotBeZero)]);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let ledger = ledger_with(&[1, 2]);
        ledger.fail_transfers_after(1);
        assert!(ledger.create_transfers(&[Transfer::new(1, 1, 2, 1)]).unwrap().is_empty());
        assert!(ledger.create_transfers(&[Transfer::new(2, 1, 2, 1)]).is_err());
        assert!(ledger.create_transfers(&[Transfer::new(3, 1, 2, 1)]).unwrap().is_empty());
        assert_eq!(ledger.transfer_count(), 2);
    }
}
