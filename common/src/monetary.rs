//! Monetary types for the FreeTun marketplace.
//!
//! Amounts are held as integer minor units (millimes for TND). Decimals only
//! appear at the edges, when parsing or displaying an amount.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use thiserror::Error;

/// A monetary amount in integer minor units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Amount in the currency's minor unit.
    pub minor: i64,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance from minor units.
    pub fn new(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    /// Parse a decimal string ("700.000") into minor units.
    ///
    /// Fails if the value carries more fractional digits than the currency
    /// allows, or does not fit in 64 bits of minor units.
    pub fn from_decimal_str(value: &str, currency: Currency) -> Result<Self, MoneyError> {
        let parsed: Decimal = value
            .trim()
            .parse()
            .map_err(|_| MoneyError::InvalidAmount(value.to_string()))?;
        Self::from_decimal(parsed, currency)
    }

    /// Convert a decimal amount into minor units.
    pub fn from_decimal(value: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        let places = currency.decimal_places();
        if value.round_dp(places) != value {
            return Err(MoneyError::ExcessPrecision {
                value: value.to_string(),
                currency,
            });
        }

        let mut scaled = value;
        scaled.rescale(places);
        let minor = i64::try_from(scaled.mantissa()).map_err(|_| MoneyError::Overflow)?;

        Ok(Self { minor, currency })
    }

    /// Create a zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    /// Check if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    /// Check if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.minor < 0
    }

    /// The amount as a decimal in major units.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.minor, self.currency.decimal_places())
    }

    /// Negated amount, same currency.
    pub fn negate(&self) -> Result<Self, MoneyError> {
        let minor = self.minor.checked_neg().ok_or(MoneyError::Overflow)?;
        Ok(Self {
            minor,
            currency: self.currency.clone(),
        })
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}

impl Add for Money {
    type Output = Result<Money, MoneyError>;

    fn add(self, other: Money) -> Self::Output {
        self.ensure_same_currency(&other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            minor,
            currency: self.currency,
        })
    }
}

impl Sub for Money {
    type Output = Result<Money, MoneyError>;

    fn sub(self, other: Money) -> Self::Output {
        self.ensure_same_currency(&other)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            minor,
            currency: self.currency,
        })
    }
}

/// Errors from monetary arithmetic and parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// Operands are in different currencies.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Value is not a decimal number.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Value has more fractional digits than the currency's minor unit.
    #[error("Amount {value} has more precision than {currency} allows")]
    ExcessPrecision { value: String, currency: Currency },

    /// Result does not fit in 64-bit minor units.
    #[error("Amount overflow")]
    Overflow,
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Check the code is three ASCII letters.
    pub fn is_valid(&self) -> bool {
        self.0.len() == 3 && self.0.chars().all(|c| c.is_ascii_uppercase())
    }

    /// Number of decimal places of the currency's minor unit.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "TND" | "BHD" | "KWD" | "OMR" | "LYD" | "JOD" | "IQD" => 3,
            _ => 2,
        }
    }

    /// Tunisian dinar, the marketplace's home currency.
    pub fn tnd() -> Self {
        Self::new("TND")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
