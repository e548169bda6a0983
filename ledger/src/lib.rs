//! FreeTun Ledger
//!
//! Versioned project store and double-entry journal for escrowed funds.

pub mod account;
pub mod balance;
pub mod engine;
pub mod journal;
pub mod store;

pub use account::LedgerAccount;
pub use balance::AccountBalance;
pub use engine::LedgerEngine;
pub use journal::{EntryType, JournalBatch, JournalEntry};
pub use store::{LedgerStore, ProjectChanges, ProjectSnapshot};
