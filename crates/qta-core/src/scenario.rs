//! Scenario driver (spec §4.2, component 3): runs every trial of a scenario,
//! seeding each trial's RNG deterministically from a master seed, and
//! applies the configured error policy when a trial aborts.

use tracing::{error, info};

use crate::ast::{Program, Scenario};
use crate::engine::Engine;
use crate::error::{EngineError, TrialFailure};
use crate::result::{EngineResult, ResultRow};

/// What to do when a trial raises an [`EngineError`] mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Record the failure and continue with the next trial.
    #[default]
    ContinueOnError,
    /// Abort the whole scenario run at the first failing trial.
    StopOnFirstError,
}

/// Driver configuration: error handling and an optional progress callback
/// invoked after each trial completes.
#[derive(Default)]
pub struct DriverConfig {
    pub on_error: ErrorPolicy,
    /// Called with `(trial_index, total_trials)` after each trial finishes.
    pub progress: Option<Box<dyn FnMut(u32, u32) + Send>>,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("on_error", &self.on_error)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

pub struct ScenarioDriver<'p> {
    program: &'p Program,
    config: DriverConfig,
    master_seed: u64,
}

impl<'p> ScenarioDriver<'p> {
    pub fn new(program: &'p Program, config: DriverConfig, master_seed: u64) -> Self {
        Self { program, config, master_seed }
    }

    /// Run every scenario in the program, in declared order.
    pub fn run_all(&mut self) -> Result<EngineResult, Vec<TrialFailure>> {
        let mut result = EngineResult::new();
        let mut failures = Vec::new();
        for scenario in &self.program.scenarios {
            match self.run_scenario(scenario) {
                Ok(rows) => result.extend(rows),
                Err(mut trial_failures) => {
                    failures.append(&mut trial_failures);
                    if self.config.on_error == ErrorPolicy::StopOnFirstError {
                        return Err(failures);
                    }
                }
            }
        }
        if failures.is_empty() {
            Ok(result)
        } else {
            Err(failures)
        }
    }

    /// Run every trial of a single scenario. Trial seeds are split off the
    /// master seed so the whole run is reproducible from one number while
    /// each trial still gets an independent stream.
    pub fn run_scenario(&mut self, scenario: &Scenario) -> Result<Vec<ResultRow>, Vec<TrialFailure>> {
        let mut rows = Vec::new();
        let mut failures = Vec::new();

        for trial in 0..scenario.trials {
            let seed = self.master_seed ^ (u64::from(trial).wrapping_mul(0x9E3779B97F4A7C15));
            let mut engine = Engine::new(self.program, scenario, trial, seed);
            match engine.run(scenario) {
                Ok(trial_rows) => {
                    info!(scenario = %scenario.name, trial, rows = trial_rows.len(), "trial completed");
                    rows.extend(trial_rows);
                }
                Err(e) => {
                    let failure = self.to_trial_failure(scenario, trial, &e);
                    error!(scenario = %scenario.name, trial, error = %failure, "trial aborted");
                    failures.push(failure);
                    if self.config.on_error == ErrorPolicy::StopOnFirstError {
                        if let Some(progress) = &mut self.config.progress {
                            progress(trial + 1, scenario.trials);
                        }
                        return Err(failures);
                    }
                }
            }
            if let Some(progress) = &mut self.config.progress {
                progress(trial + 1, scenario.trials);
            }
        }

        if failures.is_empty() {
            Ok(rows)
        } else {
            Err(failures)
        }
    }

    fn to_trial_failure(&self, scenario: &Scenario, trial: u32, error: &EngineError) -> TrialFailure {
        TrialFailure {
            kind: error.kind().to_string(),
            scenario: scenario.name.clone(),
            trial,
            year: scenario.start_year,
            application: None,
            substance: None,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Application, Command, Policy, Substance, YearMatcher};
    use crate::unit::Unit;
    use rust_decimal_macros::dec;

    fn deterministic_program() -> Program {
        Program {
            policies: vec![Policy {
                name: "default".into(),
                applications: vec![Application {
                    name: "Foams".into(),
                    substances: vec![Substance {
                        name: "HFC-245fa".into(),
                        commands: vec![
                            Command::Enable(crate::ast::Channel::Manufacture),
                            Command::Set {
                                stream: crate::ast::StreamKind::Manufacture,
                                value: crate::ast::Expr::SampleUniform {
                                    lo: Box::new(crate::ast::Expr::UnitLiteral(dec!(100), Unit::Kg)),
                                    hi: Box::new(crate::ast::Expr::UnitLiteral(dec!(200), Unit::Kg)),
                                },
                                during: YearMatcher::all(),
                            },
                        ],
                    }],
                }],
            }],
            scenarios: vec![Scenario {
                name: "MonteCarlo".into(),
                policies: vec!["default".into()],
                start_year: 2020,
                end_year: 2020,
                trials: 3,
            }],
        }
    }

    #[test]
    fn same_master_seed_reproduces_identical_trial_outputs() {
        let program = deterministic_program();
        let mut driver_a = ScenarioDriver::new(&program, DriverConfig::default(), 1234);
        let mut driver_b = ScenarioDriver::new(&program, DriverConfig::default(), 1234);
        let rows_a = driver_a.run_all().unwrap();
        let rows_b = driver_b.run_all().unwrap();
        let manufacture_a: Vec<_> = rows_a.rows.iter().map(|r| r.manufacture).collect();
        let manufacture_b: Vec<_> = rows_b.rows.iter().map(|r| r.manufacture).collect();
        assert_eq!(manufacture_a, manufacture_b);
    }

    #[test]
    fn runs_requested_trial_count() {
        let program = deterministic_program();
        let mut driver = ScenarioDriver::new(&program, DriverConfig::default(), 99);
        let result = driver.run_all().unwrap();
        assert_eq!(result.trial_count(), 3);
    }

    #[test]
    fn stop_on_first_error_short_circuits_remaining_trials() {
        let mut program = deterministic_program();
        program.policies[0].applications[0].substances[0].commands.push(Command::Cap {
            stream: crate::ast::StreamKind::Manufacture,
            value: crate::ast::Expr::Var("missing".into()),
            displacing: None,
            during: YearMatcher::all(),
        });
        let config = DriverConfig { on_error: ErrorPolicy::StopOnFirstError, progress: None };
        let mut driver = ScenarioDriver::new(&program, config, 5);
        let failures = driver.run_all().unwrap_err();
        assert_eq!(failures.len(), 1);
    }
}
