//! Double-entry journal of escrow money movements.

use chrono::{DateTime, Utc};
use freetun_common::{EscrowTransaction, GatewayOperation, Money, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::account::LedgerAccount;

/// Type of journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Money leaves the account.
    Debit,
    /// Money enters the account.
    Credit,
}

/// A single journal entry in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Escrow transaction this entry belongs to.
    pub transaction_id: TransactionId,
    /// Gateway operation that moved the money.
    pub operation: GatewayOperation,
    /// Account affected.
    pub account: LedgerAccount,
    pub entry_type: EntryType,
    /// Always positive; direction comes from `entry_type`.
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    fn new(
        transaction_id: TransactionId,
        operation: GatewayOperation,
        account: LedgerAccount,
        entry_type: EntryType,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            transaction_id,
            operation,
            account,
            entry_type,
            amount,
            created_at,
        }
    }

    /// Signed minor units: credits add to the account, debits subtract.
    pub fn signed_minor(&self) -> i64 {
        match self.entry_type {
            EntryType::Credit => self.amount.minor,
            EntryType::Debit => -self.amount.minor,
        }
    }
}

/// The entries of one money movement, committed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalBatch {
    pub transaction_id: TransactionId,
    pub operation: GatewayOperation,
    pub entries: Vec<JournalEntry>,
}

impl JournalBatch {
    /// Create an empty batch.
    pub fn new(transaction_id: TransactionId, operation: GatewayOperation) -> Self {
        Self {
            transaction_id,
            operation,
            entries: Vec::new(),
        }
    }

    /// Journal the movement a confirmed gateway operation made for `tx`.
    ///
    /// Capture moves the client's funds into the project's escrow account,
    /// payout moves them to the freelancer, refund back to the client.
    pub fn for_operation(
        tx: &EscrowTransaction,
        operation: GatewayOperation,
        at: DateTime<Utc>,
    ) -> Self {
        let escrow = LedgerAccount::Escrow(tx.project_id);
        let client = LedgerAccount::Client(tx.payer_id);
        let (from, to) = match operation {
            GatewayOperation::Capture => (client, escrow),
            GatewayOperation::Payout => (escrow, LedgerAccount::Freelancer(tx.payee_id)),
            GatewayOperation::Refund => (escrow, client),
        };

        let mut batch = Self::new(tx.id, operation);
        batch.transfer(from, to, tx.amount.clone(), at);
        batch
    }

    /// Add a debit/credit pair moving `amount` from one account to another.
    pub fn transfer(
        &mut self,
        from: LedgerAccount,
        to: LedgerAccount,
        amount: Money,
        at: DateTime<Utc>,
    ) {
        self.entries.push(JournalEntry::new(
            self.transaction_id,
            self.operation,
            from,
            EntryType::Debit,
            amount.clone(),
            at,
        ));
        self.entries.push(JournalEntry::new(
            self.transaction_id,
            self.operation,
            to,
            EntryType::Credit,
            amount,
            at,
        ));
    }

    /// Add a single entry.
    pub fn add_entry(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Debits equal credits per currency, and no entry carries a
    /// non-positive amount.
    pub fn is_balanced(&self) -> bool {
        if self.entries.iter().any(|e| !e.amount.is_positive()) {
            return false;
        }

        let mut balances: HashMap<&str, i128> = HashMap::new();
        for entry in &self.entries {
            *balances.entry(entry.amount.currency.code()).or_insert(0) +=
                i128::from(entry.signed_minor());
        }

        balances.values().all(|&balance| balance == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
