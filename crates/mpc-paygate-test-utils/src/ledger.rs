use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use mpc_paygate::payment::{Address, Ledger, SignedTransaction, Transaction, TxHash};
use tracing::debug;

use crate::TEST_CHAIN_ID;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transaction signature is invalid")]
    InvalidSignature,
    #[error("transaction is for chain {got}, but this is {expected}")]
    WrongChain { expected: String, got: String },
    #[error("expected sequence {expected} for account, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },
    #[error("insufficient funds: balance {balance}, amount {amount}")]
    InsufficientFunds { balance: u64, amount: u64 },
    #[error("ledger is unavailable")]
    Unavailable,
}

#[derive(Debug, Default)]
struct Account {
    balance: u64,
    sequence: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<Address, Account>,
    transactions: HashMap<TxHash, Transaction>,
    fail_submits: usize,
}

/// A ledger keeping balances in memory.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    chain_id: String,
    state: Arc<Mutex<LedgerState>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(TEST_CHAIN_ID)
    }
}

impl InMemoryLedger {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: Default::default(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Adds `amount` to the balance of `address`.
    pub fn fund(&self, address: &Address, amount: u64) {
        self.state()
            .accounts
            .entry(address.clone())
            .or_default()
            .balance += amount;
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.state()
            .accounts
            .get(address)
            .map_or(0, |account| account.balance)
    }

    /// The settled transaction `tx_hash`, if any.
    pub fn transaction(&self, tx_hash: &TxHash) -> Option<Transaction> {
        self.state().transactions.get(tx_hash).cloned()
    }

    /// Number of settled transactions.
    pub fn transaction_count(&self) -> usize {
        self.state().transactions.len()
    }

    /// Rejects the next `n` submissions with [`LedgerError::Unavailable`].
    pub fn fail_next_submits(&self, n: usize) {
        self.state().fail_submits = n;
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Ledger for InMemoryLedger {
    type Error = LedgerError;

    async fn account_sequence(&self, address: &Address) -> Result<u64, Self::Error> {
        Ok(self
            .state()
            .accounts
            .get(address)
            .map_or(0, |account| account.sequence))
    }

    async fn submit(&self, tx: SignedTransaction) -> Result<TxHash, Self::Error> {
        let mut state = self.state();
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(LedgerError::Unavailable);
        }
        if !tx.verify() {
            return Err(LedgerError::InvalidSignature);
        }
        if tx.tx.chain_id != self.chain_id {
            return Err(LedgerError::WrongChain {
                expected: self.chain_id.clone(),
                got: tx.tx.chain_id,
            });
        }
        let account = state.accounts.entry(tx.tx.payer.clone()).or_default();
        if account.sequence != tx.tx.sequence {
            return Err(LedgerError::SequenceMismatch {
                expected: account.sequence,
                got: tx.tx.sequence,
            });
        }
        if account.balance < tx.tx.amount {
            return Err(LedgerError::InsufficientFunds {
                balance: account.balance,
                amount: tx.tx.amount,
            });
        }
        account.balance -= tx.tx.amount;
        account.sequence += 1;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&tx.tx.signing_bytes());
        hasher.update(&tx.signature);
        let tx_hash = TxHash(*hasher.finalize().as_bytes());
        debug!(%tx_hash, payer = %tx.tx.payer, amount = tx.tx.amount, "settled transaction");
        state.transactions.insert(tx_hash, tx.tx);
        Ok(tx_hash)
    }
}
