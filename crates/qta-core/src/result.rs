//! Per-cell simulation output (spec §6): one row per
//! `(scenario, trial, application, substance, year)`, plus the aggregator
//! the CLI and integration tests use to combine trials.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// A single row of simulation output. Field order matches the CSV header
/// the CLI writes (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub scenario: String,
    pub trial: u32,
    pub application: String,
    pub substance: String,
    pub year: i32,
    pub manufacture: Decimal,
    pub import: Decimal,
    pub export: Decimal,
    pub recycle: Decimal,
    pub domestic_consumption: Decimal,
    pub import_consumption: Decimal,
    pub export_consumption: Decimal,
    pub recycle_consumption: Decimal,
    pub population: Decimal,
    pub population_new: Decimal,
    pub recharge_emissions: Decimal,
    pub eol_emissions: Decimal,
    pub energy_consumption: Decimal,
    /// Subset of import/export attributable to newly traded equipment's
    /// initial charge (spec §3 `tradeSupplement`).
    pub trade_import_value: Decimal,
    pub trade_import_consumption: Decimal,
    pub trade_import_population: Decimal,
    pub trade_export_value: Decimal,
    pub trade_export_consumption: Decimal,
    pub trade_export_population: Decimal,
}

impl ResultRow {
    pub fn consumption(&self) -> Decimal {
        self.domestic_consumption + self.import_consumption + self.export_consumption + self.recycle_consumption
    }

    pub const CSV_HEADER: &'static [&'static str] = &[
        "scenario",
        "trial",
        "application",
        "substance",
        "year",
        "manufacture_kg",
        "import_kg",
        "export_kg",
        "recycle_kg",
        "domestic_consumption_tco2e",
        "import_consumption_tco2e",
        "export_consumption_tco2e",
        "recycle_consumption_tco2e",
        "population_units",
        "population_new_units",
        "recharge_emissions_tco2e",
        "eol_emissions_tco2e",
        "energy_consumption_kwh",
        "trade_import_value_kg",
        "trade_import_consumption_tco2e",
        "trade_import_population_units",
        "trade_export_value_kg",
        "trade_export_consumption_tco2e",
        "trade_export_population_units",
    ];
}

/// Result set for an entire scenario run (all trials, all years).
#[derive(Debug, Clone, Default)]
pub struct EngineResult {
    pub rows: Vec<ResultRow>,
}

/// JSON-serializable envelope around a result set, stamped with the wall
/// clock time the run finished. CSV output (the CLI's default) carries no
/// such envelope since a CSV file has no header region for it.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRunReport<'a> {
    pub computed_at: DateTime<Utc>,
    pub rows: &'a [ResultRow],
}

impl<'a> ScenarioRunReport<'a> {
    pub fn new(rows: &'a [ResultRow], computed_at: DateTime<Utc>) -> Self {
        Self { computed_at, rows }
    }
}

impl EngineResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, rows: Vec<ResultRow>) {
        self.rows.extend(rows);
    }

    pub fn trial_count(&self) -> usize {
        self.rows.iter().map(|r| r.trial).collect::<std::collections::HashSet<_>>().len()
    }

    /// Mean of `domestic_consumption + import_consumption + export_consumption
    /// + recycle_consumption` across trials, for a given
    /// `(application, substance, year)`.
    pub fn mean_consumption(&self, application: &str, substance: &str, year: i32) -> Option<Decimal> {
        let matching: Vec<Decimal> = self
            .rows
            .iter()
            .filter(|r| r.application == application && r.substance == substance && r.year == year)
            .map(|r| r.consumption())
            .collect();
        if matching.is_empty() {
            return None;
        }
        let sum: Decimal = matching.iter().sum();
        Some(sum / Decimal::from(matching.len() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(trial: u32, year: i32, manufacture: Decimal) -> ResultRow {
        ResultRow {
            scenario: "Baseline".into(),
            trial,
            application: "Domestic Refrigeration".into(),
            substance: "HFC-134a".into(),
            year,
            manufacture,
            import: Decimal::ZERO,
            export: Decimal::ZERO,
            recycle: Decimal::ZERO,
            domestic_consumption: manufacture,
            import_consumption: Decimal::ZERO,
            export_consumption: Decimal::ZERO,
            recycle_consumption: Decimal::ZERO,
            population: Decimal::ZERO,
            population_new: Decimal::ZERO,
            recharge_emissions: Decimal::ZERO,
            eol_emissions: Decimal::ZERO,
            energy_consumption: Decimal::ZERO,
            trade_import_value: Decimal::ZERO,
            trade_import_consumption: Decimal::ZERO,
            trade_import_population: Decimal::ZERO,
            trade_export_value: Decimal::ZERO,
            trade_export_consumption: Decimal::ZERO,
            trade_export_population: Decimal::ZERO,
        }
    }

    #[test]
    fn mean_consumption_averages_across_trials() {
        let mut result = EngineResult::new();
        result.extend(vec![row(0, 2020, dec!(100)), row(1, 2020, dec!(200))]);
        assert_eq!(result.mean_consumption("Domestic Refrigeration", "HFC-134a", 2020), Some(dec!(150)));
    }

    #[test]
    fn trial_count_deduplicates_trial_numbers() {
        let mut result = EngineResult::new();
        result.extend(vec![row(0, 2020, dec!(1)), row(0, 2021, dec!(2)), row(1, 2020, dec!(3))]);
        assert_eq!(result.trial_count(), 2);
    }
}
