use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qta_core::result::{ResultRow, ScenarioRunReport};
use qta_core::scenario::{DriverConfig, ErrorPolicy, ScenarioDriver};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qta-cli", about = "Run Montreal Protocol / Kigali Amendment policy scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and run every scenario in a `.qta` file
    Run {
        /// Path to the `.qta` source file
        file: PathBuf,

        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a JSON report (stamped with the time the run finished)
        /// instead of the default CSV rows
        #[arg(long)]
        json: bool,

        /// Master seed for Monte Carlo sampling
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Abort the whole run on the first trial failure instead of
        /// continuing with the remaining trials
        #[arg(long)]
        stop_on_error: bool,
    },

    /// Parse a `.qta` file and report syntax errors without running it
    Validate { file: PathBuf },

    /// Print the CLI version
    Version,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("error: {report:?}");
            ExitCode::from(5)
        }
    }
}

/// Exit codes match spec §7: 0 success, 2 I/O, 3 parse errors, 4 trial
/// failures; anything else bubbles up through `Result` as exit code 5.
fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Run { file, output, json, seed, stop_on_error } => run_scenarios(&file, output, json, seed, stop_on_error),
        Commands::Validate { file } => validate_file(&file),
        Commands::Version => {
            println!("qta-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

fn run_scenarios(file: &PathBuf, output: Option<PathBuf>, json: bool, seed: u64, stop_on_error: bool) -> Result<u8> {
    let source = read_source(file)?;

    let program = match qta_core::parse(&source) {
        Ok(program) => program,
        Err(errors) => {
            for e in &errors {
                eprintln!("{}: {e}", file.display());
            }
            return Ok(3);
        }
    };

    let config = DriverConfig {
        on_error: if stop_on_error { ErrorPolicy::StopOnFirstError } else { ErrorPolicy::ContinueOnError },
        progress: Some(Box::new(|trial, total| eprintln!("trial {trial}/{total}"))),
    };
    let mut driver = ScenarioDriver::new(&program, config, seed);

    match driver.run_all() {
        Ok(result) => {
            if json {
                let report = ScenarioRunReport::new(&result.rows, chrono::Utc::now());
                match output {
                    Some(path) => {
                        let file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                        serde_json::to_writer_pretty(file, &report)?;
                    }
                    None => serde_json::to_writer_pretty(std::io::stdout(), &report)?,
                }
            } else {
                match output {
                    Some(path) => write_csv(&result.rows, &path).with_context(|| format!("writing {}", path.display()))?,
                    None => write_csv_to(&result.rows, std::io::stdout())?,
                }
            }
            Ok(0)
        }
        Err(failures) => {
            for failure in &failures {
                eprintln!("{failure}");
            }
            Ok(4)
        }
    }
}

fn validate_file(file: &PathBuf) -> Result<u8> {
    let source = read_source(file)?;
    match qta_core::parse(&source) {
        Ok(_) => {
            println!("{}: OK", file.display());
            Ok(0)
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("{}: {e}", file.display());
            }
            Ok(3)
        }
    }
}

fn read_source(file: &PathBuf) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

fn write_csv(rows: &[ResultRow], path: &PathBuf) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_csv_to(rows, file)
}

fn write_csv_to(rows: &[ResultRow], writer: impl std::io::Write) -> Result<()> {
    let mut w = csv::Writer::from_writer(writer);
    w.write_record(ResultRow::CSV_HEADER)?;
    for row in rows {
        w.write_record(&[
            row.scenario.clone(),
            row.trial.to_string(),
            row.application.clone(),
            row.substance.clone(),
            row.year.to_string(),
            row.manufacture.to_string(),
            row.import.to_string(),
            row.export.to_string(),
            row.recycle.to_string(),
            row.domestic_consumption.to_string(),
            row.import_consumption.to_string(),
            row.export_consumption.to_string(),
            row.recycle_consumption.to_string(),
            row.population.to_string(),
            row.population_new.to_string(),
            row.recharge_emissions.to_string(),
            row.eol_emissions.to_string(),
            row.energy_consumption.to_string(),
            row.trade_import_value.to_string(),
            row.trade_import_consumption.to_string(),
            row.trade_import_population.to_string(),
            row.trade_export_value.to_string(),
            row.trade_export_consumption.to_string(),
            row.trade_export_population.to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_reports_ok_for_a_well_formed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"start default
                start application "Foams"
                    start substance "HFC-245fa"
                        enable manufacture
                    end
                end
            end"#
        )
        .unwrap();
        let code = validate_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn run_writes_a_json_report_stamped_with_a_timestamp() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"start default
                start application "Foams"
                    start substance "HFC-245fa"
                        enable manufacture
                        initial charge manufacture 1 kg
                        set sales to 10 kg during 2020 to 2020
                    end
                end
            end
            start simulations
                start scenario "Baseline"
                    years 2020 to 2020
                    trials 1
                end
            end"#
        )
        .unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();
        let code = run_scenarios(&file.path().to_path_buf(), Some(out.path().to_path_buf()), true, 0, false).unwrap();
        assert_eq!(code, 0);
        let contents = fs::read_to_string(out.path()).unwrap();
        assert!(contents.contains("computed_at"));
        assert!(contents.contains("\"manufacture\""));
    }

    #[test]
    fn validate_reports_parse_error_exit_code() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "start default\n  not a valid stanza\n").unwrap();
        let code = validate_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(code, 3);
    }
}
