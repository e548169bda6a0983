//! FreeTun Escrow Coordinator
//!
//! The coordinator is the only entry point for state-changing marketplace
//! actions. It serializes work per project, authorizes the caller, applies
//! the proposal and escrow state machines, drives the payment gateway and
//! commits the result to the ledger in one versioned write.

pub mod config;
pub mod coordinator;
pub mod escrow_engine;
pub mod gateway;
pub mod identity;
pub mod lock_manager;
pub mod metrics;
pub mod proposal_matcher;
pub mod telemetry;
pub mod verification_gate;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{CoordinatorConfig, EscrowPolicy, GatewayConfig, LockConfig, PersistenceConfig};
pub use coordinator::TransactionCoordinator;
pub use escrow_engine::{DisputeResolution, GatewayInstruction};
pub use gateway::{CaptureReceipt, GatewayError, GatewayOutcome, PaymentGateway, ReconciliationOutcome};
pub use identity::{IdentityDirectory, StaticIdentityDirectory};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use proposal_matcher::{Acceptance, Cancellation};
pub use verification_gate::{Action, Decision};
