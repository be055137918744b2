use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use batchbank_core::{AccountStore, StorageError};
use serde::Deserialize;

use crate::{
    crypto,
    error::{ConfigError, ProcessError, Rejection},
    keys::KeyRegistry,
    models::{Operation, Transaction},
};

/// What happens to the rest of a batch when one operation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Any failing operation rejects the whole batch.
    #[default]
    AllOrNothing,
    /// Operations failing a business rule are skipped and the rest commit.
    /// Backend failures still reject the whole batch.
    SkipFailed,
}

impl FromStr for BatchPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_or_nothing" | "all-or-nothing" => Ok(BatchPolicy::AllOrNothing),
            "skip_failed" | "skip-failed" => Ok(BatchPolicy::SkipFailed),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for BatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPolicy::AllOrNothing => write!(f, "all_or_nothing"),
            BatchPolicy::SkipFailed => write!(f, "skip_failed"),
        }
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Committed {
        applied: usize,
        /// Operations left out under `BatchPolicy::SkipFailed`.
        skipped: Vec<Rejection>,
    },
    Rejected {
        index: Option<usize>,
        reason: ProcessError,
    },
}

impl BatchOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, BatchOutcome::Committed { .. })
    }

    /// The `(success, message)` pair reported back to the consensus engine.
    pub fn message(&self) -> (bool, String) {
        match self {
            BatchOutcome::Committed { applied, skipped } if skipped.is_empty() => {
                (true, format!("Processed {} operations", applied))
            }
            BatchOutcome::Committed { applied, skipped } => (
                true,
                format!("Processed {} operations, skipped {}", applied, skipped.len()),
            ),
            BatchOutcome::Rejected { index: Some(index), reason } => {
                (false, format!("Failed to process transaction: operation {}: {}", index, reason))
            }
            BatchOutcome::Rejected { index: None, reason } => {
                (false, format!("Failed to process transaction: {}", reason))
            }
        }
    }
}

impl From<Rejection> for BatchOutcome {
    fn from(rejection: Rejection) -> Self {
        BatchOutcome::Rejected {
            index: rejection.index,
            reason: rejection.reason,
        }
    }
}

/// Validates signed batches and applies them through one store transaction.
///
/// Batches are serialized: the store holds one overlay at a time, so a second
/// caller waits instead of seeing another batch's open transaction.
pub struct BatchProcessor {
    store: Arc<dyn AccountStore>,
    keys: Arc<KeyRegistry>,
    policy: BatchPolicy,
    writer: Mutex<()>,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn AccountStore>, keys: Arc<KeyRegistry>) -> Self {
        Self {
            store,
            keys,
            policy: BatchPolicy::default(),
            writer: Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Checks one operation against committed state only.
    pub fn validate_operation(&self, op: &Operation) -> Result<(), ProcessError> {
        op.validate_shape()?;

        let key = self.keys.get(op.from).ok_or(ProcessError::UnknownSigner(op.from))?;
        if !crypto::verify(&key, &op.signing_message(), &op.signature) {
            return Err(ProcessError::InvalidSignature);
        }

        let balance = match self.store.get_balance(op.from) {
            Ok(balance) => balance,
            Err(StorageError::AccountNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if balance < op.amount {
            return Err(ProcessError::InsufficientBalance {
                balance,
                amount: op.amount,
            });
        }
        Ok(())
    }

    /// Validation without mutation: every operation must pass on its own.
    pub fn validate(&self, tx: &Transaction) -> Result<(), Rejection> {
        let _writer = self.lock_writer();
        self.ensure_no_open_transaction()?;
        tx.validate_shape()?;
        for (index, op) in tx.operations.iter().enumerate() {
            self.validate_operation(op).map_err(|reason| Rejection::at(index, reason))?;
        }
        Ok(())
    }

    pub fn process(&self, tx: &Transaction) -> BatchOutcome {
        let started = Instant::now();
        let outcome = match self.run(tx) {
            Ok((applied, skipped)) => BatchOutcome::Committed { applied, skipped },
            Err(rejection) => rejection.into(),
        };

        match &outcome {
            BatchOutcome::Committed { applied, skipped } => {
                metrics::counter!("batchbank_batches_committed", 1);
                metrics::counter!("batchbank_operations_applied", *applied as u64);
                metrics::histogram!("batchbank_commit_seconds", started.elapsed().as_secs_f64());
                tracing::debug!(applied, skipped = skipped.len(), "Batch committed");
            }
            BatchOutcome::Rejected { index, reason } => {
                metrics::counter!("batchbank_batches_rejected", 1);
                if reason.is_domain() {
                    tracing::debug!(?index, %reason, "Batch rejected");
                } else {
                    tracing::warn!(?index, %reason, "Batch failed");
                }
            }
        }
        outcome
    }

    fn run(&self, tx: &Transaction) -> Result<(usize, Vec<Rejection>), Rejection> {
        let _writer = self.lock_writer();
        self.ensure_no_open_transaction()?;
        if tx.operations.is_empty() {
            return Err(Rejection::batch(ProcessError::EmptyTransaction));
        }

        let mut skipped = Vec::new();
        let mut eligible = Vec::with_capacity(tx.operations.len());
        for (index, op) in tx.operations.iter().enumerate() {
            match self.validate_operation(op) {
                Ok(()) => eligible.push((index, op)),
                Err(reason) => self.skip_or_reject(&mut skipped, index, reason)?,
            }
        }

        self.store.begin_transaction().map_err(Rejection::batch)?;
        let mut applied = 0;
        for (index, op) in eligible {
            match self.apply(op) {
                Ok(()) => applied += 1,
                Err(e) => {
                    if let Err(rejection) = self.skip_or_reject(&mut skipped, index, e.into()) {
                        self.abort();
                        return Err(rejection);
                    }
                }
            }
        }

        // A failed commit has already discarded the overlay.
        self.store.commit().map_err(Rejection::batch)?;
        Ok((applied, skipped))
    }

    fn skip_or_reject(&self, skipped: &mut Vec<Rejection>, index: usize, reason: ProcessError) -> Result<(), Rejection> {
        if self.policy == BatchPolicy::SkipFailed && reason.is_domain() {
            tracing::debug!(index, %reason, "Skipping operation");
            skipped.push(Rejection::at(index, reason));
            return Ok(());
        }
        Err(Rejection::at(index, reason))
    }

    /// Debit then credit. A failed credit reverts the debit so a skipped
    /// operation leaves nothing behind in the open transaction.
    fn apply(&self, op: &Operation) -> Result<(), StorageError> {
        self.store.update_balance(op.from, -op.amount)?;
        if let Err(e) = self.store.update_balance(op.to, op.amount) {
            self.store.update_balance(op.from, op.amount)?;
            return Err(e);
        }
        Ok(())
    }

    fn abort(&self) {
        if let Err(e) = self.store.rollback() {
            tracing::warn!(error = %e, "Rollback after failed batch also failed");
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_no_open_transaction(&self) -> Result<(), Rejection> {
        if self.store.in_transaction() {
            return Err(Rejection::batch(StorageError::TransactionAlreadyOpen));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use batchbank_memory::MemoryBackend;

    fn setup(policy: BatchPolicy) -> (BatchProcessor, KeyPair, KeyPair) {
        let store = Arc::new(MemoryBackend::store());
        store.initialize().unwrap();
        let keys = Arc::new(KeyRegistry::new());
        let alice = KeyPair::from_seed(&[1u8; 32]);
        let bob = KeyPair::from_seed(&[2u8; 32]);
        keys.register(1, alice.verifying_key()).unwrap();
        keys.register(2, bob.verifying_key()).unwrap();
        (BatchProcessor::new(store, keys).with_policy(policy), alice, bob)
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("skip_failed".parse::<BatchPolicy>().unwrap(), BatchPolicy::SkipFailed);
        assert_eq!("all-or-nothing".parse::<BatchPolicy>().unwrap(), BatchPolicy::AllOrNothing);
        assert!("sometimes".parse::<BatchPolicy>().is_err());
    }

    #[test]
    fn test_validation_reads_committed_balance() {
        let (processor, alice, _) = setup(BatchPolicy::AllOrNothing);
        processor.store().create_account(1, 100).unwrap();

        // Each operation fits on its own even though together they do not.
        let tx = Transaction::new(vec![Operation::signed(1, 2, 60, &alice), Operation::signed(1, 2, 60, &alice)]);
        assert!(processor.validate(&tx).is_ok());

        let tx = Transaction::new(vec![Operation::signed(1, 2, 101, &alice)]);
        let rejection = processor.validate(&tx).unwrap_err();
        assert!(matches!(rejection.reason, ProcessError::InsufficientBalance { balance: 100, amount: 101 }));
    }

    #[test]
    fn test_missing_sender_counts_as_zero() {
        let (processor, alice, _) = setup(BatchPolicy::AllOrNothing);
        let tx = Transaction::new(vec![Operation::signed(1, 2, 1, &alice)]);
        let rejection = processor.validate(&tx).unwrap_err();
        assert!(matches!(rejection.reason, ProcessError::InsufficientBalance { balance: 0, amount: 1 }));
    }

    #[test]
    fn test_signature_must_come_from_sender() {
        let (processor, _, bob) = setup(BatchPolicy::AllOrNothing);
        processor.store().create_account(1, 100).unwrap();

        let tx = Transaction::new(vec![Operation::signed(1, 2, 10, &bob)]);
        assert!(matches!(processor.validate(&tx).unwrap_err().reason, ProcessError::InvalidSignature));

        let tx = Transaction::new(vec![Operation::signed(3, 2, 10, &bob)]);
        assert!(matches!(processor.validate(&tx).unwrap_err().reason, ProcessError::UnknownSigner(3)));
    }

    #[test]
    fn test_validation_refuses_open_transaction() {
        let (processor, alice, _) = setup(BatchPolicy::AllOrNothing);
        processor.store().create_account(1, 100).unwrap();
        processor.store().begin_transaction().unwrap();

        let tx = Transaction::new(vec![Operation::signed(1, 2, 10, &alice)]);
        let rejection = processor.validate(&tx).unwrap_err();
        assert!(matches!(rejection.reason, ProcessError::Storage(StorageError::TransactionAlreadyOpen)));
        assert!(!processor.process(&tx).is_committed());
        assert!(processor.store().in_transaction());
    }

    #[test]
    fn test_skip_failed_commits_the_rest() {
        let (processor, alice, bob) = setup(BatchPolicy::SkipFailed);
        processor.store().create_account(1, 100).unwrap();
        processor.store().create_account(2, 10).unwrap();

        let tx = Transaction::new(vec![
            Operation::signed(1, 2, 60, &alice),
            Operation::signed(1, 2, 60, &alice),
            Operation::signed(2, 1, 5, &alice),
            Operation::signed(2, 3, 5, &bob),
        ]);
        match processor.process(&tx) {
            BatchOutcome::Committed { applied, skipped } => {
                assert_eq!(applied, 2);
                let indexes: Vec<_> = skipped.iter().map(|r| r.index).collect();
                assert_eq!(indexes, vec![Some(2), Some(1)]);
            }
            other => panic!("expected commit, got {:?}", other),
        }
        assert_eq!(processor.store().get_balance(1).unwrap(), 40);
        assert_eq!(processor.store().get_balance(2).unwrap(), 65);
        assert_eq!(processor.store().get_balance(3).unwrap(), 5);
    }

    #[test]
    fn test_failed_credit_reverts_debit() {
        let (processor, alice, _) = setup(BatchPolicy::SkipFailed);
        processor.store().create_account(1, 100).unwrap();
        processor.store().create_account(2, i64::MAX).unwrap();

        let tx = Transaction::new(vec![Operation::signed(1, 2, 10, &alice)]);
        match processor.process(&tx) {
            BatchOutcome::Committed { applied, skipped } => {
                assert_eq!(applied, 0);
                assert!(matches!(skipped[0].reason, ProcessError::Storage(StorageError::BalanceOverflow { id: 2 })));
            }
            other => panic!("expected commit, got {:?}", other),
        }
        assert_eq!(processor.store().get_balance(1).unwrap(), 100);
    }

    #[test]
    fn test_concurrent_batches_all_commit() {
        let (processor, alice, bob) = setup(BatchPolicy::AllOrNothing);
        processor.store().create_account(1, 1000).unwrap();
        processor.store().create_account(2, 1000).unwrap();
        let from_alice = Transaction::new(vec![Operation::signed(1, 3, 1, &alice)]);
        let from_bob = Transaction::new(vec![Operation::signed(2, 4, 1, &bob)]);

        let rejected: Vec<String> = std::thread::scope(|scope| {
            let streams = [&from_alice, &from_bob].map(|tx| {
                let processor = &processor;
                scope.spawn(move || {
                    (0..300)
                        .map(|_| processor.process(tx))
                        .filter(|outcome| !outcome.is_committed())
                        .map(|outcome| outcome.message().1)
                        .collect::<Vec<_>>()
                })
            });
            streams.into_iter().flat_map(|handle| handle.join().unwrap()).collect()
        });

        assert!(rejected.is_empty(), "rejected: {:?}", rejected);
        assert_eq!(processor.store().get_balance(1).unwrap(), 700);
        assert_eq!(processor.store().get_balance(2).unwrap(), 700);
        assert_eq!(processor.store().get_balance(3).unwrap(), 300);
        assert_eq!(processor.store().get_balance(4).unwrap(), 300);
    }

    #[test]
    fn test_outcome_messages() {
        let committed = BatchOutcome::Committed {
            applied: 2,
            skipped: Vec::new(),
        };
        assert_eq!(committed.message(), (true, "Processed 2 operations".to_string()));

        let rejected = BatchOutcome::Rejected {
            index: Some(1),
            reason: ProcessError::InvalidSignature,
        };
        assert_eq!(
            rejected.message(),
            (false, "Failed to process transaction: operation 1: invalid signature".to_string())
        );
    }
}
