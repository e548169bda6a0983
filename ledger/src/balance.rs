//! Account balance tracking.

use chrono::{DateTime, Utc};
use freetun_common::{Currency, Money, MoneyError};
use serde::{Deserialize, Serialize};

use crate::account::LedgerAccount;
use crate::journal::JournalEntry;

/// Running balance of a ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: LedgerAccount,
    /// Credits minus debits.
    pub balance: Money,
    /// Number of entries applied.
    pub entry_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Create a new zero balance.
    pub fn zero(account: LedgerAccount, currency: Currency) -> Self {
        Self {
            account,
            balance: Money::zero(currency),
            entry_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Balance after applying `entry`, without mutating this one.
    pub fn applied(&self, entry: &JournalEntry) -> Result<Self, MoneyError> {
        let delta = Money::new(entry.signed_minor(), entry.amount.currency.clone());
        Ok(Self {
            account: self.account,
            balance: (self.balance.clone() + delta)?,
            entry_count: self.entry_count + 1,
            updated_at: entry.created_at,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.balance.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalBatch;
    use freetun_common::{GatewayOperation, ProjectId, TransactionId};

    #[test]
    fn test_balance_follows_entries() {
        let project_id = ProjectId::new();
        let escrow = LedgerAccount::Escrow(project_id);
        let client = LedgerAccount::Client(freetun_common::ActorId::new());

        let mut batch = JournalBatch::new(TransactionId::new(), GatewayOperation::Capture);
        batch.transfer(client, escrow, Money::new(650_000, Currency::tnd()), Utc::now());

        let mut balance = AccountBalance::zero(escrow, Currency::tnd());
        for entry in batch.entries.iter().filter(|e| e.account == escrow) {
            balance = balance.applied(entry).unwrap();
        }

        assert_eq!(balance.balance.minor, 650_000);
        assert_eq!(balance.entry_count, 1);
    }

    #[test]
    fn test_currency_mismatch_is_refused() {
        let escrow = LedgerAccount::Escrow(ProjectId::new());
        let client = LedgerAccount::Client(freetun_common::ActorId::new());
        let mut batch = JournalBatch::new(TransactionId::new(), GatewayOperation::Capture);
        batch.transfer(client, escrow, Money::new(10, Currency::eur()), Utc::now());

        let balance = AccountBalance::zero(escrow, Currency::tnd());
        assert!(balance.applied(&batch.entries[1]).is_err());
    }
}
