//! Money type for the credit system.
//!
//! All persisted ledger columns are integer **cents**. Metering produces
//! sub-cent amounts, so the internal representation is integer nanodollars
//! (10^-9 USD): one cent is 10_000_000 nanodollars. Conversion to and from
//! cents happens only at the persistence and API boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Nanodollars per cent
pub const NANOS_PER_CENT: i64 = 10_000_000;

/// Signed amount of platform credit, nanodollar precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// Construct from whole cents (the persistence boundary)
    pub fn from_cents(cents: i64) -> Self {
        Credits(cents * NANOS_PER_CENT)
    }

    /// Construct from raw nanodollars (metering boundary)
    pub fn from_nanos(nanos: i64) -> Self {
        Credits(nanos)
    }

    /// Raw nanodollar value
    pub fn nanos(&self) -> i64 {
        self.0
    }

    /// Convert to cents, rounding half away from zero.
    ///
    /// Used when a sub-cent metering amount has to cross the cents-only
    /// ledger boundary.
    pub fn to_cents_rounded(&self) -> i64 {
        let half = NANOS_PER_CENT / 2;
        if self.0 >= 0 {
            (self.0 + half) / NANOS_PER_CENT
        } else {
            (self.0 - half) / NANOS_PER_CENT
        }
    }

    /// True for exact multiples of one cent
    pub fn is_whole_cents(&self) -> bool {
        self.0 % NANOS_PER_CENT == 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{}${}.{:02}",
            sign,
            abs / 1_000_000_000,
            (abs % 1_000_000_000) / NANOS_PER_CENT as u64
        )
    }
}

impl Add for Credits {
    type Output = Credits;
    fn add(self, rhs: Credits) -> Credits {
        Credits(self.0 + rhs.0)
    }
}

impl AddAssign for Credits {
    fn add_assign(&mut self, rhs: Credits) {
        self.0 += rhs.0;
    }
}

impl Sub for Credits {
    type Output = Credits;
    fn sub(self, rhs: Credits) -> Credits {
        Credits(self.0 - rhs.0)
    }
}

impl SubAssign for Credits {
    fn sub_assign(&mut self, rhs: Credits) {
        self.0 -= rhs.0;
    }
}

impl Neg for Credits {
    type Output = Credits;
    fn neg(self) -> Credits {
        Credits(-self.0)
    }
}

impl Sum for Credits {
    fn sum<I: Iterator<Item = Credits>>(iter: I) -> Credits {
        Credits(iter.map(|c| c.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_roundtrip() {
        let c = Credits::from_cents(2500);
        assert_eq!(c.to_cents_rounded(), 2500);
        assert!(c.is_whole_cents());
        assert_eq!(c.nanos(), 25_000_000_000);
    }

    #[test]
    fn test_subcent_rounding() {
        // 0.4 of a cent rounds down, 0.5 rounds away from zero
        assert_eq!(Credits::from_nanos(4_000_000).to_cents_rounded(), 0);
        assert_eq!(Credits::from_nanos(5_000_000).to_cents_rounded(), 1);
        assert_eq!(Credits::from_nanos(-5_000_000).to_cents_rounded(), -1);
        assert_eq!(Credits::from_nanos(14_999_999).to_cents_rounded(), 1);
    }

    #[test]
    fn test_arithmetic() {
        let a = Credits::from_cents(100);
        let b = Credits::from_cents(40);
        assert_eq!(a - b, Credits::from_cents(60));
        assert_eq!(-(a - b), Credits::from_cents(-60));
        let total: Credits = vec![a, b].into_iter().sum();
        assert_eq!(total, Credits::from_cents(140));
    }

    #[test]
    fn test_display() {
        assert_eq!(Credits::from_cents(2500).to_string(), "$25.00");
        assert_eq!(Credits::from_cents(-7).to_string(), "-$0.07");
    }
}
