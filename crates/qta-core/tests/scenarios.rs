//! End-to-end scenarios exercised through the public `.qta` source surface
//! rather than by constructing AST nodes directly.

use approx::assert_abs_diff_eq;
use qta_core::scenario::{DriverConfig, ScenarioDriver};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn run(source: &str, seed: u64) -> qta_core::EngineResult {
    let program = qta_core::parse(source).expect("program should parse");
    let mut driver = ScenarioDriver::new(&program, DriverConfig::default(), seed);
    driver.run_all().expect("scenario should run without trial failures")
}

#[test]
fn single_year_cap_limits_manufacture_without_a_displacement_target() {
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "HFC-134a"
                    enable manufacture
                    initial charge manufacture 1 kg
                    set sales to 100 kg during 2020 to 2020
                    equals 5 tCO2e / mt during 2020 to 2020
                    cap sales at 50 % during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "Baseline"
                years 2020 to 2020
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let row = result.rows.iter().find(|r| r.year == 2020).unwrap();
    assert_eq!(row.manufacture, dec!(50));
    // 5 tCO2e/mt == 0.005 tCO2e/kg; 50 kg * 0.005 == 0.25 tCO2e (spec §8 scenario 1).
    assert_eq!(row.domestic_consumption, dec!(0.25));
}

#[test]
fn cap_with_displacing_moves_excess_onto_the_named_substance() {
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "HFC-134a"
                    enable manufacture
                    initial charge manufacture 1 kg
                    set sales to 100 kg during 2020 to 2020
                    cap sales at 60 kg displacing "R-600a" during 2020 to 2020
                end
                start substance "R-600a"
                    enable manufacture
                    initial charge manufacture 2 kg
                end
            end
        end
        start simulations
            start scenario "Transition"
                years 2020 to 2020
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let hfc = result.rows.iter().find(|r| r.substance == "HFC-134a").unwrap();
    let r600a = result.rows.iter().find(|r| r.substance == "R-600a").unwrap();
    assert_eq!(hfc.manufacture, dec!(60));
    // 40 kg excess at 1 kg/unit is 40 units; at R-600a's own 2 kg/unit charge
    // that's 80 kg.
    assert_eq!(r600a.manufacture, dec!(80));
}

#[test]
fn floor_with_displacing_adds_the_same_correction_onto_the_named_substance() {
    let src = r#"
        start default
            start application "Foams"
                start substance "HFC-245fa"
                    enable manufacture
                    initial charge manufacture 1 kg
                    set sales to 20 kg during 2020 to 2020
                    floor sales at 50 kg displacing "HFO-1234ze" during 2020 to 2020
                end
                start substance "HFO-1234ze"
                    enable manufacture
                    initial charge manufacture 1 kg
                    set sales to 200 kg during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "MinimumShare"
                years 2020 to 2020
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let floored = result.rows.iter().find(|r| r.substance == "HFC-245fa").unwrap();
    let other = result.rows.iter().find(|r| r.substance == "HFO-1234ze").unwrap();
    assert_eq!(floored.manufacture, dec!(50));
    // floor is symmetrical with cap: the 30 kg raise applied to HFC-245fa is
    // also added onto HFO-1234ze (identical initial charges here, so no
    // further conversion), not subtracted from it (spec §4.3, §8 scenario 4).
    assert_eq!(other.manufacture, dec!(230));
}

#[test]
fn cap_displacement_nets_recharge_demand_through_differing_initial_charges() {
    // Spec §8 scenario 3: sub1 builds to 20 units of prior equipment at
    // 10 kg/unit, then declares a 10% recharge at 10 kg/unit/year (20 kg of
    // this year's 100 kg manufacture is already spoken for); capping at 5
    // units resolves to a 70 kg threshold (50 kg of new equipment + 20 kg
    // recharge), so the 30 kg excess displaces onto sub2 at sub2's own
    // 20 kg/unit charge: 30 kg / 10 kg/unit * 20 kg/unit = 60 kg.
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "sub1"
                    enable manufacture
                    initial charge manufacture 10 kg
                    set sales to 200 kg during 2020 to 2020
                    set sales to 100 kg during 2021 to 2021
                    recharge 10 % with 10 kg during 2021 to 2021
                    cap sales at 5 units during 2021 to 2021
                end
                start substance "sub2"
                    enable manufacture
                    initial charge manufacture 20 kg
                    set sales to 200 kg during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "Transition"
                years 2020 to 2021
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let sub1 = result.rows.iter().find(|r| r.substance == "sub1" && r.year == 2021).unwrap();
    let sub2 = result.rows.iter().find(|r| r.substance == "sub2" && r.year == 2021).unwrap();
    assert_eq!(sub1.manufacture, dec!(70));
    assert_eq!(sub2.manufacture, dec!(260));
}

#[test]
fn floor_displacement_nets_recharge_demand_through_differing_initial_charges() {
    // Spec §8 scenario 4: same config as scenario 3 (sub1 builds to 20 units
    // of prior equipment at 10 kg/unit, then a 10% recharge at 10 kg/unit
    // reserves 20 kg of this year's manufacture); flooring manufacture at 50
    // kg to 10 units resolves to a 120 kg threshold (100 kg of equipment +
    // 20 kg recharge), so the 70 kg deficit raise displaces onto sub2 at
    // sub2's own 20 kg/unit charge: 70 kg / 10 kg/unit * 20 kg/unit = 140 kg.
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "sub1"
                    enable manufacture
                    initial charge manufacture 10 kg
                    set sales to 200 kg during 2020 to 2020
                    set sales to 50 kg during 2021 to 2021
                    recharge 10 % with 10 kg during 2021 to 2021
                    floor sales at 10 units displacing "sub2" during 2021 to 2021
                end
                start substance "sub2"
                    enable manufacture
                    initial charge manufacture 20 kg
                    set sales to 200 kg during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "Transition"
                years 2020 to 2021
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let sub1 = result.rows.iter().find(|r| r.substance == "sub1" && r.year == 2021).unwrap();
    let sub2 = result.rows.iter().find(|r| r.substance == "sub2" && r.year == 2021).unwrap();
    assert_eq!(sub1.manufacture, dec!(120));
    assert_eq!(sub2.manufacture, dec!(340));
}

#[test]
fn recharge_emissions_subtract_recycle_consumption_and_clamp_at_zero() {
    // Spec §8 scenario 5: 1000 units of prior equipment, recharge 10% at
    // 0.15 kg/unit (15 kg serviced), recovery 50% with 100% reuse
    // (recycleVolume = 1000 * 0.15 * 0.5 * 1.0 = 75 kg). The recycled mass
    // outweighs the recharge demand, so rechargeEmissions clamps to zero
    // rather than going negative.
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "HFC-134a"
                    enable manufacture
                    initial charge manufacture 0.15 kg
                    set sales to 150 kg during 2020 to 2020
                    equals 2 tCO2e / mt during 2021 to 2021
                    recharge 10 % with 0.15 kg during 2021 to 2021
                    recover 50 % reuse 100 % during 2021 to 2021
                end
            end
        end
        start simulations
            start scenario "Baseline"
                years 2020 to 2021
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let row = result.rows.iter().find(|r| r.year == 2021).unwrap();
    assert_eq!(row.recycle, dec!(75));
    // recycleConsumption = 75 kg * 0.002 tCO2e/kg == 0.15 tCO2e.
    assert_eq!(row.recycle_consumption, dec!(0.15));
    assert_eq!(row.recharge_emissions, Decimal::ZERO);
}

#[test]
fn population_never_goes_negative_across_a_multi_year_retirement_run() {
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "HFC-134a"
                    enable manufacture
                    initial charge manufacture 0.2 kg
                    set sales to 100 kg during 2020 to 2020
                    set sales to 0 kg during 2021 to 2030
                    retire 80 % during 2021 to 2030
                end
            end
        end
        start simulations
            start scenario "PhaseOut"
                years 2020 to 2030
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    assert!(result.rows.iter().all(|r| r.population >= Decimal::ZERO));
}

#[test]
fn same_seed_is_deterministic_across_independent_runs() {
    let src = r#"
        start default
            start application "Foams"
                start substance "HFC-245fa"
                    enable manufacture
                    set sales to sample uniformly from 100 kg to 300 kg during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "MonteCarlo"
                years 2020 to 2020
                trials 5
            end
        end
    "#;
    let a = run(src, 777);
    let b = run(src, 777);
    let manufacture_a: Vec<_> = a.rows.iter().map(|r| r.manufacture).collect();
    let manufacture_b: Vec<_> = b.rows.iter().map(|r| r.manufacture).collect();
    assert_eq!(manufacture_a, manufacture_b);
}

#[test]
fn replace_converts_through_each_substances_own_initial_charge() {
    let src = r#"
        start default
            start application "Domestic Refrigeration"
                start substance "HFC-134a"
                    enable manufacture
                    initial charge manufacture 1 kg
                    set sales to 100 kg during 2020 to 2020
                    replace 50 kg of manufacture with "R-600a" during 2020 to 2020
                end
                start substance "R-600a"
                    enable manufacture
                    initial charge manufacture 0.5 kg
                end
            end
        end
        start simulations
            start scenario "Substitution"
                years 2020 to 2020
                trials 1
            end
        end
    "#;
    let result = run(src, 1);
    let hfc = result.rows.iter().find(|r| r.substance == "HFC-134a").unwrap();
    let r600a = result.rows.iter().find(|r| r.substance == "R-600a").unwrap();
    assert_eq!(hfc.manufacture, dec!(50));
    // 50 kg at 1 kg/unit is 50 units of equipment; at 0.5 kg/unit that's 25 kg.
    assert_eq!(r600a.manufacture, dec!(25));
}

#[test]
fn uniform_sampling_trial_mean_lands_near_the_midpoint() {
    let src = r#"
        start default
            start application "Foams"
                start substance "HFC-245fa"
                    enable manufacture
                    set sales to sample uniformly from 100 kg to 300 kg during 2020 to 2020
                end
            end
        end
        start simulations
            start scenario "MonteCarlo"
                years 2020 to 2020
                trials 200
            end
        end
    "#;
    let result = run(src, 42);
    let mean = result.mean_consumption("Foams", "HFC-245fa", 2020).unwrap();
    // Sampled uniformly from [100, 300], so the trial mean should sit near
    // the 200 midpoint; exact equality isn't expected from random sampling,
    // so this checks closeness instead.
    assert_abs_diff_eq!(mean.to_f64().unwrap(), 200.0, epsilon = 25.0);
}
