//! In-memory account balances.
//!
//! Every read and write of the account map goes through one mutex, and a
//! transfer's debit and credit happen inside a single critical section.

use crate::error::LedgerError;
use crate::types::{AccountId, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Whether a transfer may leave the sender with a negative balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdraftPolicy {
    #[default]
    Allow,
    Reject,
}

pub struct Ledger {
    accounts: Mutex<HashMap<AccountId, i64>>,
    overdraft: OverdraftPolicy,
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_policy(OverdraftPolicy::Allow)
    }

    pub fn with_policy(overdraft: OverdraftPolicy) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            overdraft,
        }
    }

    /// Debit `from` and credit `to` atomically.
    ///
    /// Unknown accounts start from zero. With [`OverdraftPolicy::Allow`] this
    /// only fails on overflow. With `Reject`, a negative amount or a debit below
    /// zero leaves the ledger untouched.
    pub fn apply(&self, tx: &Transaction) -> Result<(), LedgerError> {
        // A negative amount debits `to`, which the balance check below never sees.
        if self.overdraft == OverdraftPolicy::Reject && tx.amount < 0 {
            return Err(LedgerError::NegativeAmount(tx.amount));
        }

        let mut accounts = self.accounts.lock();

        let from_balance = accounts.get(&tx.from).copied().unwrap_or(0);
        let debited = from_balance
            .checked_sub(tx.amount)
            .ok_or_else(|| LedgerError::Overflow(tx.from.clone()))?;
        if self.overdraft == OverdraftPolicy::Reject && debited < 0 {
            return Err(LedgerError::InsufficientFunds {
                account: tx.from.clone(),
                balance: from_balance,
                amount: tx.amount,
            });
        }

        if tx.from == tx.to {
            accounts.entry(tx.from.clone()).or_insert(0);
            return Ok(());
        }

        let to_balance = accounts.get(&tx.to).copied().unwrap_or(0);
        let credited = to_balance
            .checked_add(tx.amount)
            .ok_or_else(|| LedgerError::Overflow(tx.to.clone()))?;

        accounts.insert(tx.from.clone(), debited);
        accounts.insert(tx.to.clone(), credited);
        Ok(())
    }

    pub fn contains_account(&self, account: &str) -> bool {
        self.accounts.lock().contains_key(account)
    }

    /// Register an account with a zero balance. Existing balances are kept.
    /// Returns true if the account was new.
    pub fn insert_account(&self, account: &str) -> bool {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(account) {
            return false;
        }
        accounts.insert(account.to_string(), 0);
        true
    }

    /// Credit an account outside of any transfer and return its new balance.
    /// Used to seed initial balances.
    pub fn deposit(&self, account: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut accounts = self.accounts.lock();
        let balance = accounts.entry(account.to_string()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(account.to_string()))?;
        Ok(*balance)
    }

    pub fn balance(&self, account: &str) -> Option<i64> {
        self.accounts.lock().get(account).copied()
    }

    /// Consistent copy of every balance, ordered by account.
    pub fn snapshot(&self) -> BTreeMap<AccountId, i64> {
        let accounts = self.accounts.lock();
        accounts.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Log every account and balance; returns the snapshot that was logged.
    pub fn print_ledger(&self) -> BTreeMap<AccountId, i64> {
        let snapshot = self.snapshot();
        for (account, amount) in &snapshot {
            tracing::info!("Account {} amount {}", account, amount);
        }
        snapshot
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
