//! `UnitValue` — a pair of an exact-decimal magnitude and a canonical unit
//! string (spec §3). Units are lowercase tokens, joined by `/` for ratios
//! (e.g. `tco2e/mt`). An empty unit string is a pure number.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Default division precision: 10 fractional digits, half-up rounding (spec §3).
pub const DIVISION_SCALE: u32 = 10;

/// An exact-decimal magnitude paired with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct UnitValue {
    pub magnitude: Decimal,
    pub unit: Unit,
}

/// Canonical units are small enough in number to intern as a fixed enum
/// instead of carrying `String` allocations through every arithmetic op —
/// ratios are the only composite case and are represented as `Ratio`.
///
/// Parsing is lenient on whitespace and case (`"kg / unit"`, `"Kg/Unit"`);
/// `Unit::parse` is the single place that normalizes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    None,
    Kg,
    Mt,
    TCo2e,
    Unit,
    KWh,
    Percent,
    Year,
    /// `num / den`, each itself a non-ratio `Unit`.
    Ratio(Atom, Atom),
}

/// A non-ratio unit, usable as either side of a [`Unit::Ratio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Atom {
    None,
    Kg,
    Mt,
    TCo2e,
    Unit,
    KWh,
    Percent,
    Year,
}

impl Atom {
    fn parse(token: &str) -> Option<Atom> {
        match token.trim().to_lowercase().as_str() {
            "" => Some(Atom::None),
            "kg" => Some(Atom::Kg),
            "mt" => Some(Atom::Mt),
            "tco2e" => Some(Atom::TCo2e),
            "unit" | "units" => Some(Atom::Unit),
            "kwh" => Some(Atom::KWh),
            "%" | "percent" => Some(Atom::Percent),
            "year" | "years" => Some(Atom::Year),
            // Reserved but not actionable per spec §4.1 — accepted syntactically,
            // resolved to the time atom so a matcher never rejects a program
            // for using them.
            "month" | "months" | "day" | "days" => Some(Atom::Year),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Atom::None => "",
            Atom::Kg => "kg",
            Atom::Mt => "mt",
            Atom::TCo2e => "tCO2e",
            Atom::Unit => "unit",
            Atom::KWh => "kWh",
            Atom::Percent => "%",
            Atom::Year => "year",
        }
    }
}

impl From<Atom> for Unit {
    fn from(a: Atom) -> Unit {
        match a {
            Atom::None => Unit::None,
            Atom::Kg => Unit::Kg,
            Atom::Mt => Unit::Mt,
            Atom::TCo2e => Unit::TCo2e,
            Atom::Unit => Unit::Unit,
            Atom::KWh => Unit::KWh,
            Atom::Percent => Unit::Percent,
            Atom::Year => Unit::Year,
        }
    }
}

impl Unit {
    /// Parse a canonical unit string, e.g. `"kg"`, `"kg / unit"`, `"tCO2e / mt"`.
    pub fn parse(raw: &str) -> Option<Unit> {
        let raw = raw.trim();
        if let Some((num, den)) = raw.split_once('/') {
            return Some(Unit::Ratio(Atom::parse(num)?, Atom::parse(den)?));
        }
        Atom::parse(raw).map(Unit::from)
    }

    pub fn is_ratio(&self) -> bool {
        matches!(self, Unit::Ratio(_, _))
    }

    pub fn is_percent(&self) -> bool {
        matches!(self, Unit::Percent)
    }

    /// Numerator atom — the unit itself, for a non-ratio unit.
    pub fn numerator(&self) -> Atom {
        match self {
            Unit::Ratio(n, _) => *n,
            Unit::None => Atom::None,
            Unit::Kg => Atom::Kg,
            Unit::Mt => Atom::Mt,
            Unit::TCo2e => Atom::TCo2e,
            Unit::Unit => Atom::Unit,
            Unit::KWh => Atom::KWh,
            Unit::Percent => Atom::Percent,
            Unit::Year => Atom::Year,
        }
    }

    pub fn denominator(&self) -> Option<Atom> {
        match self {
            Unit::Ratio(_, d) => Some(*d),
            _ => None,
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Ratio(n, d) => write!(f, "{} / {}", n.as_str(), d.as_str()),
            other => write!(f, "{}", other.numerator().as_str()),
        }
    }
}

impl UnitValue {
    pub fn new(magnitude: Decimal, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    pub fn zero(unit: Unit) -> Self {
        Self { magnitude: Decimal::ZERO, unit }
    }

    pub fn from_parts(magnitude: Decimal, unit_str: &str) -> Option<Self> {
        Unit::parse(unit_str).map(|unit| Self { magnitude, unit })
    }

    /// Clamp a negative magnitude to zero, per the spec §3 "any negative
    /// computed total ... is clamped to zero" invariant.
    pub fn clamped_nonneg(mut self) -> Self {
        if self.magnitude.is_sign_negative() {
            self.magnitude = Decimal::ZERO;
        }
        self
    }
}

/// Divide `a / b` at [`DIVISION_SCALE`] fractional digits with half-up
/// rounding. Returns `None` on division by zero — callers raise the
/// appropriately-scoped [`crate::error::DomainError`].
pub fn divide_exact(a: Decimal, b: Decimal) -> Option<Decimal> {
    if b.is_zero() {
        return None;
    }
    Some((a / b).round_dp_with_strategy(DIVISION_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_simple_units() {
        assert_eq!(Unit::parse("kg"), Some(Unit::Kg));
        assert_eq!(Unit::parse("Units"), Some(Unit::Unit));
        assert_eq!(Unit::parse(""), Some(Unit::None));
    }

    #[test]
    fn parses_ratio_units_with_whitespace() {
        assert_eq!(Unit::parse("kg / unit"), Some(Unit::Ratio(Atom::Kg, Atom::Unit)));
        assert_eq!(Unit::parse("tCO2e/mt"), Some(Unit::Ratio(Atom::TCo2e, Atom::Mt)));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert_eq!(Unit::parse("furlong"), None);
    }

    #[test]
    fn divide_exact_rounds_half_up_at_ten_digits() {
        let got = divide_exact(dec!(1), dec!(3)).unwrap();
        assert_eq!(got, Decimal::new(3333333333, 10));
    }

    #[test]
    fn divide_exact_rejects_zero_denominator() {
        assert_eq!(divide_exact(dec!(5), dec!(0)), None);
    }

    #[test]
    fn clamps_negative_to_zero() {
        let v = UnitValue::new(dec!(-4), Unit::Kg).clamped_nonneg();
        assert_eq!(v.magnitude, Decimal::ZERO);
    }
}
