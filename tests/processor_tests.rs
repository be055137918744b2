use std::sync::Arc;

use batchbank::{
    backend::{open_store, BackendConfig, Connectors},
    crypto::KeyPair,
    error::ProcessError,
    keys::KeyRegistry,
    models::{Operation, Transaction},
    processor::{BatchOutcome, BatchPolicy, BatchProcessor},
    AccountStore, StorageError,
};
use batchbank_ledger::MemoryLedger;
use batchbank_redis::MemoryCache;
use tempfile::TempDir;

struct Harness {
    processor: BatchProcessor,
    alice: KeyPair,
    _dir: TempDir,
}

impl Harness {
    fn store(&self) -> &Arc<dyn AccountStore> {
        self.processor.store()
    }

    fn balances(&self) -> Vec<(u64, i64)> {
        self.store().get_all_accounts().unwrap().iter().map(|a| (a.id, a.balance)).collect()
    }
}

fn backends(dir: &TempDir) -> Vec<BackendConfig> {
    let sled = format!("kind = \"sled\"\npath = {:?}", dir.path().join("sled").to_string_lossy());
    let sqlite = format!("kind = \"sqlite\"\npath = {:?}", dir.path().join("accounts.db").to_string_lossy());
    [
        "kind = \"memory\"".to_string(),
        sled,
        sqlite,
        "kind = \"redis\"\naddress = \"cache:6379\"".to_string(),
        "kind = \"ledger\"\naddresses = [\"3000\"]".to_string(),
    ]
    .iter()
    .map(|s| toml::from_str(s).unwrap())
    .collect()
}

fn harnesses(policy: BatchPolicy) -> Vec<Harness> {
    (0..5)
        .map(|i| {
            let dir = TempDir::new().unwrap();
            let config = backends(&dir).swap_remove(i);
            let connectors = Connectors {
                cache: Arc::new(MemoryCache::new()),
                ledger: Some(Arc::new(MemoryLedger::new())),
            };
            let store = open_store(&config, &connectors).unwrap();
            store.initialize().unwrap();

            let keys = Arc::new(KeyRegistry::new());
            let alice = KeyPair::from_seed(&[1u8; 32]);
            keys.register(1, alice.verifying_key()).unwrap();
            Harness {
                processor: BatchProcessor::new(store, keys).with_policy(policy),
                alice,
                _dir: dir,
            }
        })
        .collect()
}

#[test]
fn test_valid_batch_commits_net_effect() {
    for h in harnesses(BatchPolicy::AllOrNothing) {
        h.store().create_account(1, 1000).unwrap();
        h.store().create_account(2, 0).unwrap();

        let tx = Transaction::new(vec![Operation::signed(1, 2, 100, &h.alice), Operation::signed(1, 2, 50, &h.alice)]);
        let outcome = h.processor.process(&tx);
        assert!(matches!(outcome, BatchOutcome::Committed { applied: 2, .. }), "{}: {:?}", h.store().name(), outcome);
        assert_eq!(h.balances(), vec![(1, 850), (2, 150)], "{}", h.store().name());
        assert!(!h.store().in_transaction());
    }
}

#[test]
fn test_overdraft_rejects_whole_batch() {
    for h in harnesses(BatchPolicy::AllOrNothing) {
        h.store().create_account(1, 100).unwrap();

        let tx = Transaction::new(vec![Operation::signed(1, 2, 60, &h.alice), Operation::signed(1, 2, 60, &h.alice)]);
        match h.processor.process(&tx) {
            BatchOutcome::Rejected { index, reason } => {
                assert_eq!(index, Some(1), "{}", h.store().name());
                assert!(matches!(reason, ProcessError::Storage(StorageError::InsufficientBalance { id: 1, .. })));
            }
            other => panic!("{}: expected rejection, got {:?}", h.store().name(), other),
        }
        assert_eq!(h.balances(), vec![(1, 100)], "{}", h.store().name());
        assert!(!h.store().account_exists(2).unwrap());
        assert!(!h.store().in_transaction());
    }
}

#[test]
fn test_skip_failed_keeps_valid_operations() {
    for h in harnesses(BatchPolicy::SkipFailed) {
        h.store().create_account(1, 100).unwrap();

        let tx = Transaction::new(vec![
            Operation::signed(1, 2, 60, &h.alice),
            Operation::signed(1, 3, 60, &h.alice),
            Operation::signed(1, 4, 40, &h.alice),
        ]);
        match h.processor.process(&tx) {
            BatchOutcome::Committed { applied, skipped } => {
                assert_eq!(applied, 2);
                assert_eq!(skipped.len(), 1);
                assert_eq!(skipped[0].index, Some(1));
            }
            other => panic!("{}: expected commit, got {:?}", h.store().name(), other),
        }
        assert_eq!(h.balances(), vec![(1, 0), (2, 60), (4, 40)], "{}", h.store().name());
    }
}

#[test]
fn test_unsigned_batch_leaves_store_untouched() {
    for h in harnesses(BatchPolicy::AllOrNothing) {
        h.store().create_account(1, 100).unwrap();
        let mallory = KeyPair::from_seed(&[66u8; 32]);

        let tx = Transaction::new(vec![Operation::signed(1, 2, 10, &h.alice), Operation::signed(1, 3, 10, &mallory)]);
        match h.processor.process(&tx) {
            BatchOutcome::Rejected { index, reason } => {
                assert_eq!(index, Some(1));
                assert!(matches!(reason, ProcessError::InvalidSignature));
            }
            other => panic!("{}: expected rejection, got {:?}", h.store().name(), other),
        }
        assert_eq!(h.balances(), vec![(1, 100)]);
    }
}

#[test]
fn test_balances_never_go_negative() {
    for h in harnesses(BatchPolicy::AllOrNothing) {
        h.store().create_account(1, 30).unwrap();
        for amount in [10, 25, 10, 10, 5] {
            let tx = Transaction::new(vec![Operation::signed(1, 2, amount, &h.alice)]);
            h.processor.process(&tx);
            assert!(h.balances().iter().all(|(_, balance)| *balance >= 0));
        }
        assert_eq!(h.balances(), vec![(1, 0), (2, 30)], "{}", h.store().name());
    }
}

#[test]
fn test_ledger_partial_commit_is_reported_not_hidden() {
    let ledger = MemoryLedger::new();
    let connectors = Connectors {
        cache: Arc::new(MemoryCache::new()),
        ledger: Some(Arc::new(ledger.clone())),
    };
    let config: BackendConfig = toml::from_str("kind = \"ledger\"\naddresses = [\"3000\"]").unwrap();
    let store = open_store(&config, &connectors).unwrap();
    store.initialize().unwrap();
    store.create_account(1, 100).unwrap();
    store.create_account(2, 0).unwrap();

    let keys = Arc::new(KeyRegistry::new());
    let alice = KeyPair::from_seed(&[1u8; 32]);
    keys.register(1, alice.verifying_key()).unwrap();
    let processor = BatchProcessor::new(store.clone(), keys);

    ledger.fail_transfers_after(1);
    let tx = Transaction::new(vec![Operation::signed(1, 2, 40, &alice)]);
    match processor.process(&tx) {
        BatchOutcome::Rejected { index: None, reason } => {
            assert!(matches!(reason, ProcessError::Storage(StorageError::PartialCommit { applied: Some(1), total: 2, .. })));
        }
        other => panic!("expected partial commit, got {:?}", other),
    }
    // Debit landed, credit did not.
    assert_eq!(store.get_balance(1).unwrap(), 60);
    assert_eq!(store.get_balance(2).unwrap(), 0);
}
