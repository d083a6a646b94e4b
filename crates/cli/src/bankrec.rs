//! `vgrid bankrec`: allocate bank statement lines to open receivables/payables.

use std::path::PathBuf;

use clap::Subcommand;
use tracing::debug;
use visigrid_bankrec::{BankrecError, MovementStatus, Scenario, ScenarioRun};

use crate::exit_codes::{bankrec_exit_code, EXIT_BANKREC_OPEN_BALANCE, EXIT_BANKREC_RUNTIME};
use crate::CliError;

#[derive(Subcommand)]
pub enum BankrecCommands {
    /// Propose allocations for every movement of a scenario
    #[command(after_help = "\
Examples:
  vgrid bankrec run january.scenario.toml
  vgrid bankrec run january.scenario.toml --json
  vgrid bankrec run january.scenario.toml --validate --output result.json")]
    Run {
        /// Path to the scenario TOML file
        scenario: PathBuf,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Commit each proposal (decrement residuals, record exchange entries)
        #[arg(long)]
        validate: bool,
    },

    /// Check a scenario file without running it
    #[command(after_help = "\
Examples:
  vgrid bankrec validate january.scenario.toml")]
    Validate {
        /// Path to the scenario TOML file
        scenario: PathBuf,
    },
}

pub fn cmd_bankrec(cmd: BankrecCommands) -> Result<(), CliError> {
    match cmd {
        BankrecCommands::Run { scenario, json, output, validate } => {
            cmd_bankrec_run(scenario, json, output, validate)
        }
        BankrecCommands::Validate { scenario } => cmd_bankrec_validate(scenario),
    }
}

fn bankrec_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError { code, message: msg.into(), hint: None }
}

fn engine_err(err: BankrecError) -> CliError {
    let hint = match &err {
        BankrecError::Configuration(msg) if msg.contains("suspense") => {
            Some("set [context.accounts] suspense or a per-journal suspense account".to_string())
        }
        BankrecError::MissingColumn { .. } => {
            Some("required columns: id, account, date, currency, residual".to_string())
        }
        _ => None,
    };
    CliError { code: bankrec_exit_code(&err), message: err.to_string(), hint }
}

fn cmd_bankrec_run(
    scenario_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
    commit: bool,
) -> Result<(), CliError> {
    debug!(path = %scenario_path.display(), commit, "loading scenario");
    let scenario = Scenario::load(&scenario_path).map_err(engine_err)?;
    let run = visigrid_bankrec::run(&scenario, commit).map_err(engine_err)?;

    let json_str = serde_json::to_string_pretty(&run)
        .map_err(|e| bankrec_err(EXIT_BANKREC_RUNTIME, format!("JSON serialization error: {e}")))?;

    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| bankrec_err(EXIT_BANKREC_RUNTIME, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    } else {
        print_outcomes(&run);
    }

    // Human summary to stderr
    let s = &run.summary;
    eprintln!(
        "bankrec '{}': {} movements, {} reconciled, {} open balance, {} unmatched, {} errors",
        run.name, s.movements, s.reconciled, s.open_balance, s.unmatched, s.errors,
    );
    if s.exchange_differences > 0 || s.warnings > 0 {
        eprintln!(
            "{} exchange difference(s), {} warning(s)",
            s.exchange_differences, s.warnings,
        );
    }
    if commit {
        eprintln!("committed: {}", s.committed);
    }

    if s.errors > 0 || s.open_balance > 0 || s.unmatched > 0 {
        return Err(bankrec_err(EXIT_BANKREC_OPEN_BALANCE, "open balances remain"));
    }

    Ok(())
}

fn print_outcomes(run: &ScenarioRun) {
    for outcome in &run.outcomes {
        match (&outcome.result, outcome.status) {
            (_, MovementStatus::Error) => println!(
                "{}  error  {}",
                outcome.movement_id,
                outcome.error.as_deref().unwrap_or(""),
            ),
            (Some(result), status) => {
                println!("{}  {}", outcome.movement_id, status);
                for line in &result.lines {
                    println!(
                        "    {:<16} {:<10} {:>14} {}",
                        line.kind.to_string(),
                        line.account,
                        line.balance.to_string(),
                        line.label,
                    );
                }
            }
            (None, status) => println!("{}  {}", outcome.movement_id, status),
        }
    }
}

fn cmd_bankrec_validate(scenario_path: PathBuf) -> Result<(), CliError> {
    let scenario = Scenario::load(&scenario_path).map_err(engine_err)?;
    eprintln!(
        "valid: scenario '{}' with {} movement(s), {} open line(s), {} explicit match(es)",
        scenario.name,
        scenario.movements.len(),
        scenario.open_lines.len(),
        scenario.matches.len(),
    );
    Ok(())
}
