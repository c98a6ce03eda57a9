//! Core data types used across the monitoring engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Prices and Quantities
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic on prices and position sizes.
///
/// Wraps `rust_decimal::Decimal` so exit-order quantities never drift from
/// exchange-reported position sizes. Every price, quantity, and P&L value in
/// the engine goes through this type; binary floating point is not used for
/// money anywhere.
///
/// # Example
/// ```
/// use tpsl_engine::Money;
/// let size = Money::new(3, 1);        // 0.3
/// let step = Money::new(1, 3);        // 0.001
/// assert_eq!(size.floor_to_step(step), size);
/// ```
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    /// Zero value
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// One value
    pub const ONE: Money = Money(Decimal::ONE);

    /// One hundred, for percentage math
    pub const ONE_HUNDRED: Money = Money(Decimal::ONE_HUNDRED);

    /// Create from mantissa and scale: `new(255, 3)` is `0.255`
    pub fn new(mantissa: i64, scale: u32) -> Self {
        Money(Decimal::new(mantissa, scale))
    }

    /// Create from an integer count
    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    /// Convert to f64 for ratio comparisons (urgency distance); never used
    /// for order quantities or prices.
    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Get absolute value
    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// Absolute difference between two values
    pub fn abs_diff(self, other: Self) -> Self {
        (self - other).abs()
    }

    /// Check if value is zero
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Check if value is positive
    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Check if value is negative
    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Get maximum of two values
    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    /// Get minimum of two values
    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    /// Floor to an exchange quantity step. A zero or negative step returns
    /// the value unchanged.
    pub fn floor_to_step(self, step: Money) -> Self {
        if !step.is_positive() {
            return self;
        }
        Money((self.0 / step.0).floor() * step.0)
    }

    /// Round to the nearest exchange price tick. A zero or negative tick
    /// returns the value unchanged.
    pub fn round_to_tick(self, tick: Money) -> Self {
        if !tick.is_positive() {
            return self;
        }
        Money((self.0 / tick.0).round() * tick.0)
    }

    /// Round to specified decimal places
    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    /// Get the underlying Decimal
    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Money(Decimal::from_str(s)?))
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

// ============================================================================
// Identity types
// ============================================================================

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every monitor pass, cache read, and event emission.
/// Arc<str> keeps those clones at O(1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Exit orders rest on the opposite side of the position
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buy" => Ok(Side::Buy),
            "Sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Trading account. Each account has its own credentials and its own set of
/// monitors; the engine never falls back from one to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Account {
    Main,
    Mirror,
}

impl Account {
    /// Prefix carried by every client order link ID placed for this account
    pub fn link_prefix(self) -> &'static str {
        match self {
            Account::Main => "BOT",
            Account::Mirror => "MIR",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Account::Main => "main",
            Account::Mirror => "mirror",
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Account {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Account::Main),
            "mirror" => Ok(Account::Mirror),
            other => Err(format!("unknown account: {}", other)),
        }
    }
}

/// Monitor lifecycle phase. Ordering is load-bearing: transitions only ever
/// move to a strictly greater phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Building,
    Monitoring,
    ProfitTaking,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Building => "BUILDING",
            Phase::Monitoring => "MONITORING",
            Phase::ProfitTaking => "PROFIT_TAKING",
            Phase::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-monitor scheduling priority. Declared most-urgent first so sorting a
/// due list ascending dispatches critical monitors ahead of the rest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Critical,
    Urgent,
    Active,
    #[default]
    Building,
    Stable,
    Dormant,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Urgency::Critical => "CRITICAL",
            Urgency::Urgent => "URGENT",
            Urgency::Active => "ACTIVE",
            Urgency::Building => "BUILDING",
            Urgency::Stable => "STABLE",
            Urgency::Dormant => "DORMANT",
        };
        f.write_str(s)
    }
}

/// Identity of a single monitor: one open position on one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorKey {
    pub symbol: Symbol,
    pub side: Side,
    pub account: Account,
}

impl MonitorKey {
    pub fn new(symbol: Symbol, side: Side, account: Account) -> Self {
        Self {
            symbol,
            side,
            account,
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.symbol, self.side, self.account)
    }
}

impl FromStr for MonitorKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '_');
        let account = parts
            .next()
            .ok_or_else(|| format!("malformed monitor key: {}", s))?
            .parse::<Account>()?;
        let side = parts
            .next()
            .ok_or_else(|| format!("malformed monitor key: {}", s))?
            .parse::<Side>()?;
        let symbol = parts
            .next()
            .filter(|sym| !sym.is_empty())
            .ok_or_else(|| format!("malformed monitor key: {}", s))?;
        Ok(MonitorKey::new(Symbol::new(symbol), side, account))
    }
}

/// Exchange-published trading rules for one symbol, cached per symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: Symbol,
    pub qty_step: Money,
    pub min_qty: Money,
    pub tick_size: Money,
    pub price_scale: u32,
}
