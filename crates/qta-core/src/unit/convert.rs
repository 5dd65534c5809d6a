//! Context-aware unit conversion (spec §4.1): volume, consumption, population,
//! and energy are all convertible into one another through the engine's
//! current per-(application, substance) parameters. Percent has a distinct
//! meaning for every command, captured in [`PercentMode`].

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::UnitError;
use crate::unit::value::{divide_exact, Atom, Unit, UnitValue};

/// Snapshot of the engine state a conversion needs to resolve a ratio or a
/// percent (spec §4.1 table): "using current engine state (initial charge,
/// GHG intensity, population, elapsed time)".
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversionContext {
    /// Mass per unit for the channel this conversion concerns (kg/unit).
    pub initial_charge: Decimal,
    /// tCO2e per kg.
    pub ghg_intensity: Decimal,
    /// kWh per kg.
    pub energy_intensity: Decimal,
    /// Current equipment population, in units.
    pub population: Decimal,
    /// Current aggregate consumption, in tCO2e.
    pub consumption: Decimal,
    /// Years elapsed since the simulation's start year.
    pub years_elapsed: i64,
    /// This year's recharge mass (`priorEquipment * rechargePct * intensity`,
    /// spec §4.3) — serviced demand that a sales total must be reduced by
    /// before it is converted into newly added equipment.
    pub recharge_mass: Decimal,
    /// Recycled mass available to offset virgin manufacture
    /// (`priorEquipment * rechargeIntensity * recoverPct * reusePct`).
    pub recycle_offset: Decimal,
}

/// How a `%` magnitude is interpreted, per the spec §4.1 percent-semantics
/// table. Every command that accepts a unit value picks exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentMode {
    /// `set sales/equipment/consumption`: `x := base * %`
    AbsoluteOfBase,
    /// `change *`: `x := base * (1 + %)`
    RelativeToBase,
    /// `retire`, `cap`, `floor`: `target := base * %`
    FractionOfBase,
    /// `recover` / `replace`: uniform across sub-streams, percent is already
    /// a plain rate and needs no base multiplication.
    Uniform,
}

pub struct UnitConverter;

impl UnitConverter {
    /// Convert `value` into `target`, using `base` as the reference quantity
    /// for percent semantics (`command` names the caller for error messages).
    pub fn convert(
        value: UnitValue,
        target: Unit,
        base: Decimal,
        percent_mode: PercentMode,
        ctx: &ConversionContext,
        command: &str,
    ) -> Result<UnitValue, UnitError> {
        if value.unit == target {
            return Ok(value);
        }

        if value.unit.is_percent() {
            return Ok(UnitValue::new(Self::resolve_percent(value.magnitude, base, percent_mode), target));
        }

        let magnitude = Self::convert_magnitude(value, target, ctx).ok_or_else(|| UnitError::Incompatible {
            from: value.unit.to_string(),
            to: target.to_string(),
            command: command.to_string(),
        })?;

        Ok(UnitValue::new(magnitude, target))
    }

    fn resolve_percent(pct: Decimal, base: Decimal, mode: PercentMode) -> Decimal {
        match mode {
            PercentMode::AbsoluteOfBase => base * (pct / dec!(100)),
            PercentMode::RelativeToBase => base * (Decimal::ONE + pct / dec!(100)),
            PercentMode::FractionOfBase => base * (pct / dec!(100)),
            PercentMode::Uniform => pct / dec!(100),
        }
    }

    /// Resolve a non-percent conversion via the dimension graph in spec §4.1.
    /// Ratio inversion is attempted when the direct route is unsupported.
    fn convert_magnitude(value: UnitValue, target: Unit, ctx: &ConversionContext) -> Option<Decimal> {
        let m = value.magnitude;

        match (value.unit, target) {
            // volume <-> consumption
            (Unit::Kg, Unit::TCo2e) | (Unit::Mt, Unit::TCo2e) => {
                Some(Self::to_kg(m, value.unit) * ctx.ghg_intensity)
            }
            (Unit::TCo2e, Unit::Kg) | (Unit::TCo2e, Unit::Mt) => {
                let kg = divide_exact(m, ctx.ghg_intensity)?;
                Some(Self::from_kg(kg, target))
            }

            // mt <-> kg
            (Unit::Kg, Unit::Mt) => Some(m / dec!(1000)),
            (Unit::Mt, Unit::Kg) => Some(m * dec!(1000)),

            // volume <-> population (via initial charge, net of this year's
            // recharge demand and offset by recycled material — spec §4.3's
            // "effective virgin available" population-recalc formula)
            (Unit::Kg, Unit::Unit) | (Unit::Mt, Unit::Unit) => {
                let virgin = (Self::to_kg(m, value.unit) - ctx.recharge_mass + ctx.recycle_offset).max(Decimal::ZERO);
                divide_exact(virgin, ctx.initial_charge)
            }
            (Unit::Unit, Unit::Kg) | (Unit::Unit, Unit::Mt) => {
                let mass = (m * ctx.initial_charge + ctx.recharge_mass - ctx.recycle_offset).max(Decimal::ZERO);
                Some(Self::from_kg(mass, target))
            }

            // consumption <-> population (volume -> units as an intermediate)
            (Unit::TCo2e, Unit::Unit) => {
                let kg = divide_exact(m, ctx.ghg_intensity)?;
                divide_exact(kg, ctx.initial_charge)
            }
            (Unit::Unit, Unit::TCo2e) => {
                if ctx.population.is_zero() {
                    None
                } else {
                    let per_unit = divide_exact(ctx.consumption, ctx.population)?;
                    Some(m * per_unit)
                }
            }

            // volume -> energy
            (Unit::Kg, Unit::KWh) | (Unit::Mt, Unit::KWh) => {
                Some(Self::to_kg(m, value.unit) * ctx.energy_intensity)
            }
            (Unit::KWh, Unit::Kg) | (Unit::KWh, Unit::Mt) => {
                let kg = divide_exact(m, ctx.energy_intensity)?;
                Some(Self::from_kg(kg, target))
            }

            // ratio sources: `x / year`, `x / unit`, `x / tCO2e` resolve to
            // their numerator atom scaled by the matching context quantity.
            (Unit::Ratio(num, Atom::Year), _) => {
                let resolved = UnitValue::new(m * Decimal::from(ctx.years_elapsed.max(0)), Unit::from(num));
                Self::convert_magnitude(resolved, target, ctx)
            }
            (Unit::Ratio(num, Atom::Unit), _) => {
                let resolved = UnitValue::new(m * ctx.population, Unit::from(num));
                Self::convert_magnitude(resolved, target, ctx)
            }
            (Unit::Ratio(num, Atom::TCo2e), _) => {
                let resolved = UnitValue::new(m * ctx.consumption, Unit::from(num));
                Self::convert_magnitude(resolved, target, ctx)
            }

            // target is itself a ratio: try inverting (e.g. volume -> kg/unit
            // by treating the request as "how much per unit of population").
            (_, Unit::Ratio(num, den)) => {
                let as_num = Self::convert_magnitude(value, Unit::from(num), ctx)?;
                let denom_qty = match den {
                    Atom::Year => Decimal::from(ctx.years_elapsed.max(1)),
                    Atom::Unit => ctx.population,
                    Atom::TCo2e => ctx.consumption,
                    _ => return None,
                };
                divide_exact(as_num, denom_qty)
            }

            _ => None,
        }
    }

    fn to_kg(m: Decimal, unit: Unit) -> Decimal {
        match unit {
            Unit::Mt => m * dec!(1000),
            _ => m,
        }
    }

    fn from_kg(kg: Decimal, target: Unit) -> Decimal {
        match target {
            Unit::Mt => kg / dec!(1000),
            _ => kg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConversionContext {
        ConversionContext {
            initial_charge: dec!(10),
            ghg_intensity: dec!(5),
            energy_intensity: dec!(2),
            population: dec!(100),
            consumption: dec!(500),
            years_elapsed: 3,
            recharge_mass: Decimal::ZERO,
            recycle_offset: Decimal::ZERO,
        }
    }

    #[test]
    fn mass_to_consumption_uses_ghg_intensity() {
        let v = UnitValue::new(dec!(10), Unit::Kg);
        let out = UnitConverter::convert(v, Unit::TCo2e, Decimal::ZERO, PercentMode::Uniform, &ctx(), "set")
            .unwrap();
        assert_eq!(out.magnitude, dec!(50));
    }

    #[test]
    fn percent_of_base_for_cap() {
        let v = UnitValue::new(dec!(50), Unit::Percent);
        let out = UnitConverter::convert(v, Unit::Kg, dec!(100), PercentMode::FractionOfBase, &ctx(), "cap")
            .unwrap();
        assert_eq!(out.magnitude, dec!(50));
    }

    #[test]
    fn change_percent_is_relative_to_base() {
        let v = UnitValue::new(dec!(10), Unit::Percent);
        let out =
            UnitConverter::convert(v, Unit::Kg, dec!(100), PercentMode::RelativeToBase, &ctx(), "change")
                .unwrap();
        assert_eq!(out.magnitude, dec!(110));
    }

    #[test]
    fn population_to_mass_uses_initial_charge() {
        let v = UnitValue::new(dec!(5), Unit::Unit);
        let out = UnitConverter::convert(v, Unit::Kg, Decimal::ZERO, PercentMode::Uniform, &ctx(), "set")
            .unwrap();
        assert_eq!(out.magnitude, dec!(50));
    }

    #[test]
    fn population_to_mass_nets_recharge_and_recycle_offset() {
        let mut c = ctx();
        c.recharge_mass = dec!(20);
        c.recycle_offset = dec!(5);
        let v = UnitValue::new(dec!(5), Unit::Unit);
        let out = UnitConverter::convert(v, Unit::Kg, Decimal::ZERO, PercentMode::Uniform, &c, "cap").unwrap();
        // 5 units * 10 kg/unit + 20 kg recharge - 5 kg recycle offset = 65 kg
        assert_eq!(out.magnitude, dec!(65));
    }

    #[test]
    fn incompatible_units_raise_unit_error() {
        let v = UnitValue::new(dec!(5), Unit::KWh);
        let err =
            UnitConverter::convert(v, Unit::Unit, Decimal::ZERO, PercentMode::Uniform, &ctx(), "set")
                .unwrap_err();
        assert!(matches!(err, UnitError::Incompatible { .. }));
    }
}
