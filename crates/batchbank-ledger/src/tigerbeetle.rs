//! `LedgerClient` over a TigerBeetle cluster.

use std::sync::Arc;

use tigerbeetle_unofficial as tb;
use tigerbeetle_unofficial::error::{
    CreateAccountErrorKind, CreateAccountsError, CreateTransferErrorKind, CreateTransfersError,
};
use tokio::runtime::{Builder, Runtime};

use crate::{
    client::{CreateAccountError, CreateTransferError, LedgerAccount, LedgerClient, LedgerConnector, LedgerError, Transfer},
    LedgerConfig,
};

/// Connects to the cluster named by `cluster_id` through every configured address.
#[derive(Debug, Default, Clone, Copy)]
pub struct TigerBeetleConnector;

impl LedgerConnector for TigerBeetleConnector {
    fn connect(&self, config: &LedgerConfig) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        let addresses = config.addresses.join(",");
        let client = tb::Client::new(config.cluster_id.0, addresses.as_str())
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        // The client completes requests from its own thread; this only parks the caller.
        let runtime = Builder::new_current_thread()
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        tracing::info!(cluster_id = %config.cluster_id, addresses = %addresses, "TigerBeetle client created");
        Ok(Arc::new(TigerBeetleClient { client, runtime }))
    }
}

pub struct TigerBeetleClient {
    client: tb::Client,
    runtime: Runtime,
}

impl LedgerClient for TigerBeetleClient {
    fn lookup_accounts(&self, ids: &[u128]) -> Result<Vec<LedgerAccount>, LedgerError> {
        let found = self
            .runtime
            .block_on(self.client.lookup_accounts(ids.to_vec()))
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        Ok(found.iter().map(from_tb_account).collect())
    }

    fn create_accounts(&self, accounts: &[LedgerAccount]) -> Result<Vec<(usize, CreateAccountError)>, LedgerError> {
        let accounts: Vec<tb::Account> = accounts
            .iter()
            .map(|a| tb::Account::new(a.id, a.ledger, a.code))
            .collect();
        match self.runtime.block_on(self.client.create_accounts(accounts)) {
            Ok(()) => Ok(Vec::new()),
            Err(CreateAccountsError::Api(api)) => Ok(api
                .as_slice()
                .iter()
                .map(|e| (e.index(), account_error(e.kind())))
                .collect()),
            Err(CreateAccountsError::Send(e)) => Err(LedgerError::Request(e.to_string())),
        }
    }

    fn create_transfers(&self, transfers: &[Transfer]) -> Result<Vec<(usize, CreateTransferError)>, LedgerError> {
        let transfers: Vec<tb::Transfer> = transfers
            .iter()
            .map(|t| {
                tb::Transfer::new(t.id)
                    .with_debit_account_id(t.debit_account_id)
                    .with_credit_account_id(t.credit_account_id)
                    .with_amount(t.amount)
                    .with_ledger(t.ledger)
                    .with_code(t.code)
            })
            .collect();
        match self.runtime.block_on(self.client.create_transfers(transfers)) {
            Ok(()) => Ok(Vec::new()),
            Err(CreateTransfersError::Api(api)) => Ok(api
                .as_slice()
                .iter()
                .map(|e| (e.index(), transfer_error(e.kind())))
                .collect()),
            Err(CreateTransfersError::Send(e)) => Err(LedgerError::Request(e.to_string())),
        }
    }
}

fn from_tb_account(account: &tb::Account) -> LedgerAccount {
    LedgerAccount {
        id: account.id(),
        ledger: account.ledger(),
        code: account.code(),
        debits_posted: account.debits_posted(),
        credits_posted: account.credits_posted(),
    }
}

fn account_error(kind: CreateAccountErrorKind) -> CreateAccountError {
    match kind {
        CreateAccountErrorKind::Exists => CreateAccountError::Exists,
        CreateAccountErrorKind::IdMustNotBeZero => CreateAccountError::IdMustNotBeZero,
        CreateAccountErrorKind::LedgerMustNotBeZero => CreateAccountError::LedgerMustNotBeZero,
        other => CreateAccountError::Rejected(format!("{:?}", other)),
    }
}

fn transfer_error(kind: CreateTransferErrorKind) -> CreateTransferError {
    match kind {
        CreateTransferErrorKind::Exists => CreateTransferError::Exists,
        CreateTransferErrorKind::IdMustNotBeZero => CreateTransferError::IdMustNotBeZero,
        CreateTransferErrorKind::DebitAccountNotFound => CreateTransferError::DebitAccountNotFound,
        CreateTransferErrorKind::CreditAccountNotFound => CreateTransferError::CreditAccountNotFound,
        CreateTransferErrorKind::AccountsMustBeDifferent => CreateTransferError::AccountsMustBeDifferent,
        CreateTransferErrorKind::TransferMustHaveTheSameLedgerAsAccounts => CreateTransferError::LedgerMismatch,
        other => CreateTransferError::Rejected(format!("{:?}", other)),
    }
}
