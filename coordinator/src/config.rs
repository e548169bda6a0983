//! Coordinator configuration.

use std::time::Duration;

use freetun_common::constants::{
    gateway_call_timeout, project_lock_timeout, MAX_PERSISTENCE_RETRIES,
};
use freetun_common::PaymentMethod;

/// Per-project lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an action waits for the project lock.
    pub acquisition_timeout: Duration,
    /// Retry hint returned with `ProjectBusy`.
    pub retry_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout: project_lock_timeout(),
            retry_after: Duration::from_millis(250),
        }
    }
}

/// Payment gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on a single capture, payout or refund call.
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: gateway_call_timeout(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Internal retries after an optimistic version conflict.
    pub max_conflict_retries: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: MAX_PERSISTENCE_RETRIES,
        }
    }
}

/// Marketplace escrow policy.
#[derive(Debug, Clone)]
pub struct EscrowPolicy {
    /// Payment methods clients may fund escrow with.
    pub accepted_methods: Vec<PaymentMethod>,
    /// Allow release before delivery when both parties consent.
    pub allow_early_release: bool,
}

impl EscrowPolicy {
    pub fn accepts(&self, method: PaymentMethod) -> bool {
        self.accepted_methods.contains(&method)
    }
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self {
            accepted_methods: vec![
                PaymentMethod::D17,
                PaymentMethod::Flouci,
                PaymentMethod::BankTransfer,
                PaymentMethod::Edinar,
            ],
            allow_early_release: true,
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Gateway configuration.
    pub gateway_config: GatewayConfig,
    /// Persistence configuration.
    pub persistence_config: PersistenceConfig,
    /// Escrow policy.
    pub escrow_policy: EscrowPolicy,
    /// Log filter directive.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_config: LockConfig::default(),
            gateway_config: GatewayConfig::default(),
            persistence_config: PersistenceConfig::default(),
            escrow_policy: EscrowPolicy::default(),
            log_level: "info".to_string(),
            log_json: true,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_millis("FREETUN_LOCK_TIMEOUT_MS") {
            config.lock_config.acquisition_timeout = timeout;
        }

        if let Some(timeout) = env_millis("FREETUN_GATEWAY_TIMEOUT_MS") {
            config.gateway_config.call_timeout = timeout;
        }

        if let Ok(retries) = std::env::var("FREETUN_MAX_CONFLICT_RETRIES") {
            if let Ok(retries) = retries.parse() {
                config.persistence_config.max_conflict_retries = retries;
            }
        }

        if let Ok(early) = std::env::var("FREETUN_ALLOW_EARLY_RELEASE") {
            config.escrow_policy.allow_early_release = early != "false" && early != "0";
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }

        if let Ok(format) = std::env::var("FREETUN_LOG_FORMAT") {
            config.log_json = format.eq_ignore_ascii_case("json");
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.lock_config.acquisition_timeout.is_zero() {
            return Err("Lock acquisition timeout cannot be 0".to_string());
        }

        if self.gateway_config.call_timeout.is_zero() {
            return Err("Gateway call timeout cannot be 0".to_string());
        }

        if self.escrow_policy.accepted_methods.is_empty() {
            return Err("At least one payment method must be accepted".to_string());
        }

        if self.log_level.trim().is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        Ok(())
    }
}
