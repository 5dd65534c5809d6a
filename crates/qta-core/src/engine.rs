//! The interpreter core (spec §4.2, component 2 + §4.3): walks a
//! [`Program`]'s policies year by year, dispatching each [`Command`] against
//! a [`StreamKeeper`] and propagating the dependent-quantity formulas
//! (sales, consumption, equipment, recharge/EOL emissions, energy).

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Uniform};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::ast::{Channel, Command, Program, Scenario, StreamKind};
use crate::error::{EngineError, ReferenceError, ScopeError, UnitError};
use crate::pushdown::{self, EvalHost};
use crate::result::ResultRow;
use crate::stream::StreamKeeper;
use crate::unit::{Atom, ConversionContext, PercentMode, Unit, UnitConverter, UnitValue};

/// Interprets one (scenario, trial) run. Not `Clone` — construct a fresh
/// `Engine` per trial from [`crate::scenario::ScenarioDriver`].
pub struct Engine<'p> {
    program: &'p Program,
    scenario_name: String,
    trial: u32,
    sim_start: i32,
    sim_end: i32,
    current_year: i32,
    streams: StreamKeeper,
    scope: Option<(String, String)>,
    vars: HashMap<(String, String, String), UnitValue>,
    rng: ChaCha8Rng,
}

impl<'p> Engine<'p> {
    pub fn new(program: &'p Program, scenario: &Scenario, trial: u32, seed: u64) -> Self {
        Self {
            program,
            scenario_name: scenario.name.clone(),
            trial,
            sim_start: scenario.start_year,
            sim_end: scenario.end_year,
            current_year: scenario.start_year,
            streams: StreamKeeper::new(),
            scope: None,
            vars: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Run every year of the scenario, returning one [`ResultRow`] per
    /// `(application, substance, year)` triple. Aborts on the first command
    /// that raises an [`EngineError`], wrapping it with year/scope context.
    pub fn run(&mut self, scenario: &Scenario) -> Result<Vec<ResultRow>, EngineError> {
        let mut rows = Vec::new();
        for year in scenario.start_year..=scenario.end_year {
            rows.extend(self.advance_year(year)?);
        }
        Ok(rows)
    }

    fn advance_year(&mut self, year: i32) -> Result<Vec<ResultRow>, EngineError> {
        self.current_year = year;
        self.streams.roll_year();

        let policy_names = self.scenario_policies();
        let mut policies = Vec::with_capacity(policy_names.len());
        for policy_name in &policy_names {
            let policy = self
                .program
                .policy(policy_name)
                .ok_or_else(|| ReferenceError::UnknownPolicy(policy_name.clone()))?;
            policies.push(policy);
        }

        // Every (application, substance) pair is registered before any
        // command runs, so a `displacing "<substance>"` target from an
        // earlier policy can always be found regardless of declaration order.
        for policy in &policies {
            for application in &policy.applications {
                for substance in &application.substances {
                    self.streams.register(&application.name, &substance.name);
                }
            }
        }

        for policy in &policies {
            for application in &policy.applications {
                for substance in &application.substances {
                    self.scope = Some((application.name.clone(), substance.name.clone()));
                    for command in &substance.commands {
                        debug!(app = %application.name, sub = %substance.name, year, "dispatching command");
                        self.dispatch(command, year)?;
                    }
                }
            }
        }
        self.scope = None;

        Ok(self.snapshot_rows(year))
    }

    fn scenario_policies(&self) -> Vec<String> {
        self.program
            .scenarios
            .iter()
            .find(|s| s.name == self.scenario_name)
            .map(|s| s.policies.clone())
            .unwrap_or_else(|| vec!["default".to_string()])
    }

    fn snapshot_rows(&self, year: i32) -> Vec<ResultRow> {
        self.streams
            .pairs()
            .map(|(app, sub)| {
                let state = self.streams.get(app, sub).expect("registered above");
                ResultRow {
                    scenario: self.scenario_name.clone(),
                    trial: self.trial,
                    application: app.clone(),
                    substance: sub.clone(),
                    year,
                    manufacture: state.manufacture,
                    import: state.import,
                    export: state.export,
                    recycle: state.recycle,
                    domestic_consumption: state.domestic_consumption,
                    import_consumption: state.import_consumption,
                    export_consumption: state.export_consumption,
                    recycle_consumption: state.recycle_consumption,
                    population: state.equipment,
                    population_new: state.new_equipment,
                    recharge_emissions: state.recharge_emissions,
                    eol_emissions: state.eol_emissions,
                    energy_consumption: state.energy,
                    trade_import_value: state.trade_supplement.import_value,
                    trade_import_consumption: state.trade_supplement.import_consumption,
                    trade_import_population: state.trade_supplement.import_population,
                    trade_export_value: state.trade_supplement.export_value,
                    trade_export_consumption: state.trade_supplement.export_consumption,
                    trade_export_population: state.trade_supplement.export_population,
                }
            })
            .collect()
    }

    // --- scope / conversion context helpers ---

    fn current_scope(&self) -> Result<(&str, &str), EngineError> {
        match &self.scope {
            Some((a, s)) => Ok((a.as_str(), s.as_str())),
            None => Err(ScopeError::NoApplication.into()),
        }
    }

    fn conversion_context_for(&self, app: &str, sub: &str) -> ConversionContext {
        let state = self.streams.get(app, sub);
        let initial_charge = state
            .map(|s| {
                let primary = if s.is_channel_enabled(Channel::Manufacture) {
                    Channel::Manufacture
                } else {
                    Channel::Import
                };
                s.initial_charge_for(primary)
            })
            .unwrap_or(Decimal::ZERO);
        let recharge_mass = state.map(|s| s.recharge_population_pct * s.recharge_intensity).unwrap_or(Decimal::ZERO);
        let recycle_offset = state
            .map(|s| s.prior_equipment * s.recharge_intensity * s.recovery_rate * s.reuse_rate)
            .unwrap_or(Decimal::ZERO);
        ConversionContext {
            initial_charge,
            ghg_intensity: state.map(|s| s.ghg_intensity).unwrap_or(Decimal::ZERO),
            energy_intensity: state.map(|s| s.energy_intensity).unwrap_or(Decimal::ZERO),
            population: state.map(|s| s.equipment).unwrap_or(Decimal::ZERO),
            consumption: state.map(|s| s.consumption()).unwrap_or(Decimal::ZERO),
            years_elapsed: (self.current_year - self.sim_start).max(0) as i64,
            recharge_mass,
            recycle_offset,
        }
    }

    fn natural_unit(stream: StreamKind) -> Unit {
        match stream {
            StreamKind::Manufacture
            | StreamKind::Import
            | StreamKind::Export
            | StreamKind::Recycle
            | StreamKind::Sales => Unit::Kg,
            StreamKind::DomesticConsumption
            | StreamKind::ImportConsumption
            | StreamKind::ExportConsumption
            | StreamKind::RecycleConsumption
            | StreamKind::Consumption
            | StreamKind::RechargeEmissions
            | StreamKind::EolEmissions => Unit::TCo2e,
            StreamKind::Equipment | StreamKind::PriorEquipment | StreamKind::NewEquipment => Unit::Unit,
            StreamKind::Energy => Unit::KWh,
        }
    }

    fn read_stream(&self, app: &str, sub: &str, stream: StreamKind) -> Result<Decimal, EngineError> {
        let state = self
            .streams
            .get(app, sub)
            .ok_or_else(|| ReferenceError::UnknownSubstance(sub.to_string()))?;
        Ok(match stream {
            StreamKind::Manufacture => state.manufacture,
            StreamKind::Import => state.import,
            StreamKind::Export => state.export,
            StreamKind::Recycle => state.recycle,
            StreamKind::Sales => state.sales(),
            StreamKind::DomesticConsumption => state.domestic_consumption,
            StreamKind::ImportConsumption => state.import_consumption,
            StreamKind::ExportConsumption => state.export_consumption,
            StreamKind::RecycleConsumption => state.recycle_consumption,
            StreamKind::Consumption => state.consumption(),
            StreamKind::Equipment => state.equipment,
            StreamKind::PriorEquipment => state.prior_equipment,
            StreamKind::NewEquipment => state.new_equipment,
            StreamKind::RechargeEmissions => state.recharge_emissions,
            StreamKind::EolEmissions => state.eol_emissions,
            StreamKind::Energy => state.energy,
        })
    }

    /// Evaluate `expr`, resolve it against `stream`'s natural unit using
    /// `percent_mode`, and return the resolved absolute magnitude.
    fn eval_against_stream(
        &mut self,
        expr: &crate::ast::Expr,
        stream: StreamKind,
        percent_mode: PercentMode,
        command: &str,
    ) -> Result<Decimal, EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let base = self.read_stream(&app, &sub, stream)?;
        let ctx = self.conversion_context_for(&app, &sub);
        let raw = pushdown::eval(expr, self)?;
        let target = Self::natural_unit(stream);
        let converted = UnitConverter::convert(raw, target, base, percent_mode, &ctx, command)?;
        Ok(converted.magnitude)
    }

    fn write_channel(&mut self, channel: Channel, value: Decimal) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let state = self.streams.get_or_register_mut(&app, &sub);
        state.set_channel_volume(channel, value.max(Decimal::ZERO));
        Self::recompute_derived(state);
        Ok(())
    }

    /// Recompute consumption/equipment/energy from the channel volumes and
    /// saved parameters (spec §4.3 dependency propagation).
    fn recompute_derived(state: &mut crate::stream::SubstanceState) {
        let sales = state.sales();
        if sales.is_sign_negative() {
            warn!("sales clamped to zero for a negative total");
        }
        state.domestic_consumption = state.manufacture.max(Decimal::ZERO) * state.ghg_intensity;
        state.import_consumption = state.import.max(Decimal::ZERO) * state.ghg_intensity;
        state.export_consumption = state.export.max(Decimal::ZERO) * state.ghg_intensity;
        state.recycle_consumption = state.recycle.max(Decimal::ZERO) * state.ghg_intensity;

        let primary_charge = if state.is_channel_enabled(Channel::Manufacture) {
            state.initial_charge_for(Channel::Manufacture)
        } else {
            state.initial_charge_for(Channel::Import)
        };
        if !primary_charge.is_zero() {
            // Spec §4.3: newly added equipment comes from the portion of
            // sales not already spoken for by recharge demand, net of
            // recycled material offsetting that same demand.
            let recharge_mass = state.recharge_population_pct * state.recharge_intensity;
            let recycle_offset = state.prior_equipment * state.recharge_intensity * state.recovery_rate * state.reuse_rate;
            let effective_virgin = (sales - recharge_mass + recycle_offset).max(Decimal::ZERO);
            let new_units = effective_virgin / primary_charge;
            state.new_equipment = new_units.max(Decimal::ZERO);
            state.equipment = (state.prior_equipment + state.new_equipment).max(Decimal::ZERO);
        }

        state.energy = sales * state.energy_intensity;

        // Recomputed here (rather than once inside `apply_recharge`) so it
        // stays correct regardless of whether `recharge` or `recover` ran
        // last within the year — recover's recycle_consumption term only
        // exists once `recompute_derived` has run at least once this year.
        let recharge_mass = state.recharge_population_pct * state.recharge_intensity;
        state.recharge_emissions = (recharge_mass * state.ghg_intensity - state.recycle_consumption).max(Decimal::ZERO);

        let import_charge = state.initial_charge_for(Channel::Import);
        state.trade_supplement.import_value = state.import;
        state.trade_supplement.import_consumption = state.import_consumption;
        state.trade_supplement.import_population =
            crate::unit::divide_exact(state.import, import_charge).unwrap_or(Decimal::ZERO);

        let export_charge = state.initial_charge_for(Channel::Export);
        state.trade_supplement.export_value = state.export;
        state.trade_supplement.export_consumption = state.export_consumption;
        state.trade_supplement.export_population =
            crate::unit::divide_exact(state.export, export_charge).unwrap_or(Decimal::ZERO);
    }

    fn scoped_state_mut(&mut self) -> Result<&mut crate::stream::SubstanceState, EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        Ok(self.streams.get_or_register_mut(&app, &sub))
    }

    // --- command dispatch ---

    fn dispatch(&mut self, command: &Command, year: i32) -> Result<(), EngineError> {
        match command {
            Command::Enable(channel) => {
                let state = self.scoped_state_mut()?;
                state.channel_enabled.insert(*channel, true);
                Ok(())
            }
            Command::InitialCharge { value, channel, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                let raw = pushdown::eval(value, self)?;
                let state = self.scoped_state_mut()?;
                state.initial_charge.insert(*channel, raw.magnitude);
                Ok(())
            }
            Command::Equals { value, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_equals(value)
            }
            Command::Set { stream, value, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_set(*stream, value)
            }
            Command::Change { stream, value, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_change(*stream, value)
            }
            Command::Cap { stream, value, displacing, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_cap(*stream, value, displacing.as_deref())
            }
            Command::Floor { stream, value, displacing, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_floor(*stream, value, displacing.as_deref())
            }
            Command::Recharge { population_pct, intensity, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_recharge(population_pct, intensity)
            }
            Command::Retire { amount, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_retire(amount)
            }
            Command::Recover { percent, reuse, displacing, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_recover(percent, reuse, displacing.as_deref())
            }
            Command::Replace { amount, from_stream, to_substance, during } => {
                if !during.matches(year, self.sim_start, self.sim_end) {
                    return Ok(());
                }
                self.apply_replace(amount, *from_stream, to_substance)
            }
            Command::Define { name, expr } => {
                let value = pushdown::eval(expr, self)?;
                let (app, sub) = self.current_scope()?;
                let key = (app.to_string(), sub.to_string(), name.clone());
                self.vars.insert(key, value);
                Ok(())
            }
        }
    }

    /// `equals` sets the substance's GHG or energy intensity (spec §4.3: "set
    /// GHG intensity (if unit is consumption/mass) or energy intensity (if
    /// unit is energy/mass). Latest write wins.") — it names no stream and
    /// touches no channel; the expression's own unit says which intensity it
    /// describes.
    fn apply_equals(&mut self, value: &crate::ast::Expr) -> Result<(), EngineError> {
        let raw = pushdown::eval(value, self)?;
        let (numerator, denominator) = match raw.unit {
            Unit::Ratio(num, den) => (num, den),
            other => {
                return Err(UnitError::Incompatible {
                    from: other.to_string(),
                    to: "tCO2e/kg or kWh/kg".to_string(),
                    command: "equals".to_string(),
                }
                .into())
            }
        };
        let per_kg = match denominator {
            Atom::Kg => raw.magnitude,
            Atom::Mt => raw.magnitude / dec!(1000),
            other => {
                return Err(UnitError::Incompatible {
                    from: format!("/{other:?}"),
                    to: "/kg or /mt".to_string(),
                    command: "equals".to_string(),
                }
                .into())
            }
        };

        let state = self.scoped_state_mut()?;
        match numerator {
            Atom::TCo2e => state.ghg_intensity = per_kg,
            Atom::KWh => state.energy_intensity = per_kg,
            other => {
                return Err(UnitError::Incompatible {
                    from: format!("{other:?}/.."),
                    to: "tCO2e/.. or kWh/..".to_string(),
                    command: "equals".to_string(),
                }
                .into())
            }
        }
        Self::recompute_derived(state);
        Ok(())
    }

    fn apply_set(&mut self, stream: StreamKind, value: &crate::ast::Expr) -> Result<(), EngineError> {
        let new_value = self.eval_against_stream(value, stream, PercentMode::AbsoluteOfBase, "set")?;
        self.write_resolved_stream(stream, new_value.max(Decimal::ZERO))
    }

    fn apply_change(&mut self, stream: StreamKind, value: &crate::ast::Expr) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let base = self.read_stream(&app, &sub, stream)?;
        let ctx = self.conversion_context_for(&app, &sub);
        let raw = pushdown::eval(value, self)?;
        let was_percent = raw.unit.is_percent();
        let target = Self::natural_unit(stream);
        let converted = UnitConverter::convert(raw, target, base, PercentMode::RelativeToBase, &ctx, "change")?;
        let new_value = if was_percent { converted.magnitude } else { base + converted.magnitude };
        self.write_resolved_stream(stream, new_value.max(Decimal::ZERO))
    }

    fn write_resolved_stream(&mut self, stream: StreamKind, value: Decimal) -> Result<(), EngineError> {
        match stream {
            StreamKind::Manufacture => self.write_channel(Channel::Manufacture, value),
            StreamKind::Import => self.write_channel(Channel::Import, value),
            StreamKind::Export => self.write_channel(Channel::Export, value),
            StreamKind::Recycle => self.write_channel(Channel::Recycle, value),
            // `sales` is derived (manufacture + import - recycle); writing it
            // adjusts manufacture to hit the target while leaving import and
            // recycle alone.
            StreamKind::Sales => {
                let state = self.scoped_state_mut()?;
                let implied_manufacture = (value - state.import + state.recycle).max(Decimal::ZERO);
                state.manufacture = implied_manufacture;
                Self::recompute_derived(state);
                Ok(())
            }
            StreamKind::Equipment => {
                let state = self.scoped_state_mut()?;
                state.equipment = value;
                Ok(())
            }
            other => Err(EngineError::Internal(format!("stream '{}' cannot be written directly", other.as_str()))),
        }
    }

    fn apply_cap(&mut self, stream: StreamKind, value: &crate::ast::Expr, displacing: Option<&str>) -> Result<(), EngineError> {
        let threshold = self.eval_against_stream(value, stream, PercentMode::FractionOfBase, "cap")?;
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let current = self.read_stream(&app, &sub, stream)?;
        if current <= threshold {
            return Ok(());
        }
        let excess = current - threshold;
        self.write_resolved_stream(stream, threshold)?;
        if let Some(dest) = displacing {
            self.displace_onto(dest, stream, excess)?;
        }
        Ok(())
    }

    fn apply_floor(&mut self, stream: StreamKind, value: &crate::ast::Expr, displacing: Option<&str>) -> Result<(), EngineError> {
        let threshold = self.eval_against_stream(value, stream, PercentMode::FractionOfBase, "floor")?;
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let current = self.read_stream(&app, &sub, stream)?;
        if current >= threshold {
            return Ok(());
        }
        let deficit = threshold - current;
        self.write_resolved_stream(stream, threshold)?;
        if let Some(dest) = displacing {
            // Symmetrical with `cap`: the correction applied to this
            // substance (here, a raise) is added onto `displacing` too,
            // converted through its own initial charge (spec §4.3, §8).
            self.displace_onto(dest, stream, deficit)?;
        }
        Ok(())
    }

    /// Move `amount` of `stream` (in the current substance's own mass unit)
    /// onto `dest_substance` within the same application. The displaced
    /// surplus/deficit is expressed in equipment units via the *source*
    /// substance's initial charge, then converted through the *destination*
    /// substance's own initial charge before being added — the same
    /// cross-substance conversion `apply_replace` uses (spec §4.3).
    fn displace_onto(&mut self, dest_substance: &str, stream: StreamKind, amount: Decimal) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        if self.streams.get(&app, dest_substance).is_none() {
            return Err(ReferenceError::UnknownSubstance(dest_substance.to_string()).into());
        }
        match stream {
            StreamKind::Manufacture | StreamKind::Import | StreamKind::Export | StreamKind::Recycle | StreamKind::Sales => {
                let channel = if stream == StreamKind::Sales { Channel::Manufacture } else { channel_for_stream(stream) };
                let source_charge = self.conversion_context_for(&app, &sub).initial_charge;
                let dest_charge = self.conversion_context_for(&app, dest_substance).initial_charge;
                let moved_dest = if dest_charge.is_zero() {
                    Decimal::ZERO
                } else if source_charge.is_zero() {
                    amount
                } else {
                    crate::unit::divide_exact(amount * dest_charge, source_charge).unwrap_or(Decimal::ZERO)
                };
                let dest_state = self.streams.get_or_register_mut(&app, dest_substance);
                let new_value = (dest_state.channel_volume(channel) + moved_dest).max(Decimal::ZERO);
                dest_state.set_channel_volume(channel, new_value);
                Self::recompute_derived(dest_state);
            }
            _ => {
                return Err(EngineError::Internal("displacement only supported for sales channels".into()));
            }
        }
        Ok(())
    }

    fn apply_retire(&mut self, amount: &crate::ast::Expr) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        // Spec §4.3: "annual retirement = priorEquipment * pct" — the base is
        // last year's equipment, not whatever's accumulated so far this year,
        // so retirement doesn't depend on command ordering within the year.
        let prior_equipment = self.streams.get(&app, &sub).map(|s| s.prior_equipment).unwrap_or(Decimal::ZERO);
        let ctx = self.conversion_context_for(&app, &sub);
        let raw = pushdown::eval(amount, self)?;
        let removed =
            UnitConverter::convert(raw, Unit::Unit, prior_equipment, PercentMode::FractionOfBase, &ctx, "retire")?.magnitude;

        let ghg_intensity = self.streams.get(&app, &sub).map(|s| s.ghg_intensity).unwrap_or(Decimal::ZERO);
        let recharge_intensity = self.streams.get(&app, &sub).map(|s| s.recharge_intensity).unwrap_or(Decimal::ZERO);
        let state = self.streams.get_or_register_mut(&app, &sub);
        let removed = removed.min(state.equipment).max(Decimal::ZERO);
        state.equipment -= removed;
        // Spec §4.3: "EOL emissions = retiredUnits * rechargeIntensity * GHG".
        state.eol_emissions += removed * recharge_intensity * ghg_intensity;
        Ok(())
    }

    fn apply_recharge(&mut self, population_pct: &crate::ast::Expr, intensity: &crate::ast::Expr) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        // Spec §4.3: recharge is serviced out of last year's equipment, so
        // its base is `priorEquipment`, not whatever `equipment` has grown to
        // from this year's sales already applied.
        let prior_equipment = self.streams.get(&app, &sub).map(|s| s.prior_equipment).unwrap_or(Decimal::ZERO);
        let ctx = self.conversion_context_for(&app, &sub);

        let pct_raw = pushdown::eval(population_pct, self)?;
        let serviced =
            UnitConverter::convert(pct_raw, Unit::Unit, prior_equipment, PercentMode::FractionOfBase, &ctx, "recharge")?.magnitude;

        let intensity_raw = pushdown::eval(intensity, self)?;
        let kg_intensity = UnitConverter::convert(intensity_raw, Unit::Kg, Decimal::ZERO, PercentMode::Uniform, &ctx, "recharge")?.magnitude;

        let state = self.streams.get_or_register_mut(&app, &sub);
        state.recharge_population_pct = serviced;
        state.recharge_intensity = kg_intensity;
        // `recompute_derived` derives rechargeEmissions from these saved
        // parameters (spec §8 scenario 5: rechargeMass * GHG -
        // recycleConsumption, clamped at zero), so it stays correct whether
        // `recharge` or `recover` runs last within the year.
        Self::recompute_derived(state);
        Ok(())
    }

    fn apply_recover(&mut self, percent: &crate::ast::Expr, reuse: &crate::ast::Expr, displacing: Option<&str>) -> Result<(), EngineError> {
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        let ctx = self.conversion_context_for(&app, &sub);

        let percent_raw = pushdown::eval(percent, self)?;
        let recovery_rate = UnitConverter::convert(percent_raw, Unit::None, Decimal::ONE, PercentMode::Uniform, &ctx, "recover")?.magnitude;
        let reuse_raw = pushdown::eval(reuse, self)?;
        let reuse_rate = UnitConverter::convert(reuse_raw, Unit::None, Decimal::ONE, PercentMode::Uniform, &ctx, "recover")?.magnitude;

        // Spec §4.3/§8 scenario 5: recycleVolume (the portion reused, added
        // to `recycle`) is `priorEquipment * rechargeIntensity * recoverPct *
        // reusePct` — based on last year's equipment and the substance's own
        // saved recharge intensity, not this year's `new_equipment`/initial
        // charge.
        let prior_equipment = self.streams.get(&app, &sub).map(|s| s.prior_equipment).unwrap_or(Decimal::ZERO);
        let recharge_intensity = self.streams.get(&app, &sub).map(|s| s.recharge_intensity).unwrap_or(Decimal::ZERO);
        let recovered = prior_equipment * recharge_intensity * recovery_rate;
        let reused = recovered * reuse_rate;
        let disposed = recovered - reused;

        let state = self.streams.get_or_register_mut(&app, &sub);
        state.recovery_rate = recovery_rate;
        state.reuse_rate = reuse_rate;
        state.displacement_rate = Decimal::ONE;
        state.recycle = (state.recycle + reused).max(Decimal::ZERO);
        Self::recompute_derived(state);

        if let Some(dest) = displacing {
            if !disposed.is_zero() {
                self.displace_onto(dest, StreamKind::Manufacture, disposed)?;
            }
        }
        Ok(())
    }

    fn apply_replace(&mut self, amount: &crate::ast::Expr, from_stream: StreamKind, to_substance: &str) -> Result<(), EngineError> {
        let moved = self.eval_against_stream(amount, from_stream, PercentMode::FractionOfBase, "replace")?;
        let (app, sub) = self.current_scope()?;
        let (app, sub) = (app.to_string(), sub.to_string());
        if self.streams.get(&app, to_substance).is_none() {
            return Err(ReferenceError::UnknownSubstance(to_substance.to_string()).into());
        }

        let source_charge = self.conversion_context_for(&app, &sub).initial_charge;
        let dest_charge = self.conversion_context_for(&app, to_substance).initial_charge;
        let moved_dest_units = if dest_charge.is_zero() {
            Decimal::ZERO
        } else if source_charge.is_zero() {
            moved
        } else {
            crate::unit::divide_exact(moved * dest_charge, source_charge).unwrap_or(Decimal::ZERO)
        };

        let channel = channel_for_stream(from_stream);
        let current = self.read_stream(&app, &sub, from_stream)?;
        self.write_resolved_stream(from_stream, (current - moved).max(Decimal::ZERO))?;

        let dest_state = self.streams.get_or_register_mut(&app, to_substance);
        let new_dest_value = (dest_state.channel_volume(channel) + moved_dest_units).max(Decimal::ZERO);
        dest_state.set_channel_volume(channel, new_dest_value);
        Self::recompute_derived(dest_state);
        Ok(())
    }
}

fn channel_for_stream(stream: StreamKind) -> Channel {
    match stream {
        StreamKind::Import => Channel::Import,
        StreamKind::Export => Channel::Export,
        StreamKind::Recycle => Channel::Recycle,
        _ => Channel::Manufacture,
    }
}

impl<'p> EvalHost for Engine<'p> {
    fn lookup_var(&self, name: &str) -> Option<UnitValue> {
        let (app, sub) = self.scope.clone()?;
        self.vars.get(&(app, sub, name.to_string())).copied()
    }

    fn years_elapsed(&self) -> i64 {
        (self.current_year - self.sim_start).max(0) as i64
    }

    fn year_absolute(&self) -> i32 {
        self.current_year
    }

    fn get_stream(&self, stream: StreamKind, of_substance: Option<&str>, as_unit: Option<Unit>) -> Result<UnitValue, EngineError> {
        let (app, current_sub) = self.current_scope()?;
        let sub = of_substance.unwrap_or(current_sub);
        let magnitude = self.read_stream(app, sub, stream)?;
        let natural = Self::natural_unit(stream);
        let value = UnitValue::new(magnitude, natural);
        match as_unit {
            Some(target) if target != natural => {
                let ctx = self.conversion_context_for(app, sub);
                Ok(UnitConverter::convert(value, target, magnitude, PercentMode::Uniform, &ctx, "get")?)
            }
            _ => Ok(value),
        }
    }

    fn sample_uniform(&mut self, lo: Decimal, hi: Decimal) -> Decimal {
        let lo_f = lo.to_f64().unwrap_or(0.0);
        let hi_f = hi.to_f64().unwrap_or(lo_f);
        if hi_f <= lo_f {
            return lo;
        }
        let dist = Uniform::new(lo_f, hi_f);
        Decimal::from_f64(dist.sample(&mut self.rng)).unwrap_or(lo)
    }

    fn sample_normal(&mut self, mean: Decimal, std: Decimal) -> Decimal {
        let mean_f = mean.to_f64().unwrap_or(0.0);
        let std_f = std.to_f64().unwrap_or(0.0);
        if std_f <= 0.0 {
            return mean;
        }
        let dist = Normal::new(mean_f, std_f).unwrap_or_else(|_| Normal::new(mean_f, 1.0).unwrap());
        Decimal::from_f64(dist.sample(&mut self.rng)).unwrap_or(mean)
    }
}
