//! Stream Keeper (spec §4, component 6): per-(application, substance) state
//! — channel volumes, consumption, equipment population, and the saved
//! parameters (GHG/energy intensity, recharge, retirement, recovery,
//! displacement, enabled channels) that later writes reuse.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::ast::{Channel, StreamKind};
use crate::unit::Unit;

/// The subset of a substance's imports/exports attributable to *initial
/// charge* of newly traded equipment (spec §3 `tradeSupplement`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeSupplement {
    pub import_value: Decimal,
    pub import_consumption: Decimal,
    pub import_population: Decimal,
    pub export_value: Decimal,
    pub export_consumption: Decimal,
    pub export_population: Decimal,
}

/// Per-(application, substance) bookkeeping. All volumes are stored in `kg`,
/// consumption in `tCO2e`, population in `unit`s — the canonical units spec
/// §3 requires writes to normalize into.
#[derive(Debug, Clone)]
pub struct SubstanceState {
    // --- channel volumes (kg) ---
    pub manufacture: Decimal,
    pub import: Decimal,
    pub export: Decimal,
    pub recycle: Decimal,

    // --- consumption (tCO2e) ---
    pub domestic_consumption: Decimal,
    pub import_consumption: Decimal,
    pub export_consumption: Decimal,
    pub recycle_consumption: Decimal,

    // --- population (units) ---
    pub equipment: Decimal,
    pub prior_equipment: Decimal,
    pub new_equipment: Decimal,

    // --- derived emissions ---
    pub recharge_emissions: Decimal,
    pub eol_emissions: Decimal,
    pub energy: Decimal,

    // --- saved parameters (latest write wins) ---
    pub ghg_intensity: Decimal,
    pub energy_intensity: Decimal,
    pub recharge_population_pct: Decimal,
    pub recharge_intensity: Decimal,
    pub retirement_rate: Decimal,
    pub recovery_rate: Decimal,
    pub reuse_rate: Decimal,
    pub displacement_rate: Decimal,
    pub initial_charge: HashMap<Channel, Decimal>,
    pub channel_enabled: HashMap<Channel, bool>,
    pub last_specified_units: HashMap<StreamKind, Unit>,

    pub trade_supplement: TradeSupplement,
}

impl Default for SubstanceState {
    fn default() -> Self {
        Self {
            manufacture: Decimal::ZERO,
            import: Decimal::ZERO,
            export: Decimal::ZERO,
            recycle: Decimal::ZERO,
            domestic_consumption: Decimal::ZERO,
            import_consumption: Decimal::ZERO,
            export_consumption: Decimal::ZERO,
            recycle_consumption: Decimal::ZERO,
            equipment: Decimal::ZERO,
            prior_equipment: Decimal::ZERO,
            new_equipment: Decimal::ZERO,
            recharge_emissions: Decimal::ZERO,
            eol_emissions: Decimal::ZERO,
            energy: Decimal::ZERO,
            ghg_intensity: Decimal::ZERO,
            energy_intensity: Decimal::ZERO,
            recharge_population_pct: Decimal::ZERO,
            recharge_intensity: Decimal::ZERO,
            retirement_rate: Decimal::ZERO,
            recovery_rate: Decimal::ZERO,
            reuse_rate: Decimal::ZERO,
            displacement_rate: Decimal::ZERO,
            initial_charge: HashMap::new(),
            channel_enabled: HashMap::new(),
            last_specified_units: HashMap::new(),
            trade_supplement: TradeSupplement::default(),
        }
    }
}

impl SubstanceState {
    pub fn sales(&self) -> Decimal {
        (self.manufacture + self.import - self.recycle).max(Decimal::ZERO)
    }

    pub fn consumption(&self) -> Decimal {
        self.domestic_consumption + self.import_consumption + self.export_consumption
            + self.recycle_consumption
    }

    pub fn is_channel_enabled(&self, c: Channel) -> bool {
        *self.channel_enabled.get(&c).unwrap_or(&false)
    }

    pub fn channel_volume(&self, c: Channel) -> Decimal {
        match c {
            Channel::Manufacture => self.manufacture,
            Channel::Import => self.import,
            Channel::Export => self.export,
            Channel::Recycle => self.recycle,
        }
    }

    pub fn set_channel_volume(&mut self, c: Channel, v: Decimal) {
        match c {
            Channel::Manufacture => self.manufacture = v,
            Channel::Import => self.import = v,
            Channel::Export => self.export = v,
            Channel::Recycle => self.recycle = v,
        }
    }

    pub fn initial_charge_for(&self, c: Channel) -> Decimal {
        *self.initial_charge.get(&c).unwrap_or(&Decimal::ZERO)
    }

    /// Begin a new year: `priorEquipment[Y] = equipment[Y-1]`, `newEquipment`
    /// reset to zero (spec §3 lifecycle).
    pub fn roll_year(&mut self) {
        self.prior_equipment = self.equipment;
        self.new_equipment = Decimal::ZERO;
    }
}

/// Registry of all (application, substance) pairs touched so far, in first
/// registration order (spec §3 "setting an application or substance
/// implicitly registers the (app,sub) pair").
#[derive(Debug, Clone, Default)]
pub struct StreamKeeper {
    order: Vec<(String, String)>,
    states: HashMap<(String, String), SubstanceState>,
}

impl StreamKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, app: &str, sub: &str) {
        let key = (app.to_string(), sub.to_string());
        if !self.states.contains_key(&key) {
            self.order.push(key.clone());
            self.states.insert(key, SubstanceState::default());
        }
    }

    pub fn get(&self, app: &str, sub: &str) -> Option<&SubstanceState> {
        self.states.get(&(app.to_string(), sub.to_string()))
    }

    pub fn get_mut(&mut self, app: &str, sub: &str) -> Option<&mut SubstanceState> {
        self.states.get_mut(&(app.to_string(), sub.to_string()))
    }

    pub fn get_or_register_mut(&mut self, app: &str, sub: &str) -> &mut SubstanceState {
        self.register(app, sub);
        self.states.get_mut(&(app.to_string(), sub.to_string())).expect("just registered")
    }

    /// All (application, substance) pairs, in registration order.
    pub fn pairs(&self) -> impl Iterator<Item = &(String, String)> {
        self.order.iter()
    }

    pub fn roll_year(&mut self) {
        for state in self.states.values_mut() {
            state.roll_year();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn registration_preserves_first_seen_order() {
        let mut keeper = StreamKeeper::new();
        keeper.register("Domestic Refrigeration", "HFC-134a");
        keeper.register("Domestic Refrigeration", "R-600a");
        keeper.register("Domestic Refrigeration", "HFC-134a");
        let pairs: Vec<_> = keeper.pairs().cloned().collect();
        assert_eq!(
            pairs,
            vec![
                ("Domestic Refrigeration".to_string(), "HFC-134a".to_string()),
                ("Domestic Refrigeration".to_string(), "R-600a".to_string()),
            ]
        );
    }

    #[test]
    fn sales_nets_manufacture_import_and_recycle_offset() {
        let mut keeper = StreamKeeper::new();
        let state = keeper.get_or_register_mut("App", "Sub");
        state.manufacture = dec!(100);
        state.import = dec!(20);
        state.recycle = dec!(10);
        assert_eq!(state.sales(), dec!(110));
    }

    #[test]
    fn roll_year_copies_equipment_into_prior_and_clears_new() {
        let mut keeper = StreamKeeper::new();
        let state = keeper.get_or_register_mut("App", "Sub");
        state.equipment = dec!(50);
        state.new_equipment = dec!(5);
        keeper.roll_year();
        let state = keeper.get("App", "Sub").unwrap();
        assert_eq!(state.prior_equipment, dec!(50));
        assert_eq!(state.new_equipment, Decimal::ZERO);
    }
}
