//! Exact-precision monetary amounts.
//!
//! All billable amounts in this crate are represented in microdollars
//! (1 USD == 1_000_000 micros) as unsigned 128-bit integers, never as floats
//! or `serde_json::Number`s. Wire representations that cross a process
//! boundary (the finalize call body, DLQ entries) use decimal strings so that
//! intermediate JSON libraries on either end never silently round a value
//! that doesn't fit in an `f64`'s 53 mantissa bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An amount of money, in microdollars, that can never be negative.
///
/// ```
/// use billing_core::amount::MicroDollars;
///
/// let a = MicroDollars::from_micros(1_500_000); // $1.50
/// let b = MicroDollars::parse_decimal_str("1500000").unwrap();
/// assert_eq!(a, b);
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MicroDollars(u128);

#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("amount string contains a decimal point or sign")]
    NotIntegerDecimal,
    #[error("amount string is not a valid base-10 integer")]
    InvalidDigits,
    #[error("amount overflowed u128")]
    Overflow,
}

/// Parse a non-negative base-10 integer with no decimal point, no leading
/// `+`/`-`, and no leading zeroes other than a bare `"0"`. Shared by every
/// wire-visible big-integer amount in this crate ([`MicroDollars`] and
/// [`TokenAmount`]) so the parsing rules can't drift between them.
fn parse_decimal_u128(s: &str) -> Result<u128, Error> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        if s.contains('.') || s.starts_with('-') || s.starts_with('+') {
            return Err(Error::NotIntegerDecimal);
        }
        return Err(Error::InvalidDigits);
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(Error::InvalidDigits);
    }
    s.parse::<u128>().map_err(|_| Error::Overflow)
}

impl MicroDollars {
    pub const ZERO: Self = Self(0);

    pub fn from_micros(micros: u128) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> u128 {
        self.0
    }

    /// Parse the decimal-string wire format required by the finalize call and
    /// DLQ entries: a non-negative base-10 integer, no decimal point, no
    /// leading `+`/`-`, no leading zeroes other than a bare `"0"`.
    pub fn parse_decimal_str(s: &str) -> Result<Self, Error> {
        parse_decimal_u128(s).map(Self)
    }

    pub fn to_decimal_str(self) -> String {
        self.0.to_string()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Saturating subtraction, floored at zero. Used for gauges that must
    /// never go negative even if an out-of-order replay briefly overcounts.
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for MicroDollars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MicroDollars {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_decimal_str(s)
    }
}

impl Serialize for MicroDollars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_decimal_str())
    }
}

impl<'de> Deserialize<'de> for MicroDollars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse_decimal_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A frozen exchange-rate snapshot, captured once at reserve time so that a
/// request's eventual settlement isn't exposed to rate drift between reserve
/// and commit.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateSnapshot {
    /// Credit units per USD at the moment of the snapshot.
    pub credit_units_per_usd: rust_decimal::Decimal,
    /// USD per unit of the settlement token (e.g. USDC) at the moment of the
    /// snapshot.
    pub usd_per_settlement_token: rust_decimal::Decimal,
    /// When this snapshot was taken.
    pub frozen_at: common::time::TimestampMillis,
}

/// An amount denominated in a settlement token's own base units (e.g. USDC's
/// 6-decimal atomic unit), as opposed to [`MicroDollars`]. Kept as a distinct
/// type so a payment challenge's on-chain amount can never be silently
/// compared against a microdollar quote without an explicit conversion
/// through the [`ExchangeRateSnapshot`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    pub fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    pub fn as_base_units(self) -> u128 {
        self.0
    }

    pub fn parse_decimal_str(s: &str) -> Result<Self, Error> {
        parse_decimal_u128(s).map(Self)
    }

    pub fn to_decimal_str(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_decimal_str(s)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_decimal_str())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse_decimal_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_integers() {
        assert_eq!(
            MicroDollars::parse_decimal_str("0").unwrap(),
            MicroDollars::ZERO
        );
        assert_eq!(
            MicroDollars::parse_decimal_str("1500000").unwrap().as_micros(),
            1_500_000
        );
    }

    #[test]
    fn rejects_decimal_points_and_signs() {
        assert_eq!(
            MicroDollars::parse_decimal_str("1.5").unwrap_err(),
            Error::NotIntegerDecimal
        );
        assert_eq!(
            MicroDollars::parse_decimal_str("-5").unwrap_err(),
            Error::NotIntegerDecimal
        );
    }

    #[test]
    fn rejects_leading_zeroes() {
        assert!(MicroDollars::parse_decimal_str("007").is_err());
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let a = MicroDollars::from_micros(5);
        let b = MicroDollars::from_micros(10);
        assert_eq!(a.saturating_sub(b), MicroDollars::ZERO);
    }
}
