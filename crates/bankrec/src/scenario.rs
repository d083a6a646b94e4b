//! Scenario files: reconciliation context, market data, open lines and the
//! statement movements to process, in one TOML document.
//!
//! Open lines may also come from a CSV file referenced by `open_lines_file`,
//! resolved relative to the scenario.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::book::Book;
use crate::config::ReconciliationContext;
use crate::currency::{RateRow, RateTable};
use crate::error::BankrecError;
use crate::evidence::{compute_summary, MovementOutcome, MovementStatus, RunSummary};
use crate::exchange::ExchangeDifferenceEntry;
use crate::model::{BankMovement, EarlyPaymentDiscount, OpenLine};
use crate::session::Reconciler;
use crate::tax::{TaxRule, TaxTable};

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    pub context: ReconciliationContext,
    #[serde(default)]
    pub rates: Vec<RateRow>,
    #[serde(default)]
    pub taxes: BTreeMap<String, TaxRule>,
    #[serde(default)]
    pub open_lines: Vec<OpenLine>,
    #[serde(default)]
    pub open_lines_file: Option<String>,
    #[serde(default)]
    pub movements: Vec<BankMovement>,
    /// Explicit selections. Movements without one go through auto-matching.
    #[serde(default)]
    pub matches: Vec<MatchSpec>,
    /// Documents already posted when the run starts.
    #[serde(default)]
    pub posted_documents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchSpec {
    pub movement: String,
    #[serde(default)]
    pub open_lines: Vec<String>,
    /// Post any open balance here instead of suspense.
    #[serde(default)]
    pub open_balance_account: Option<String>,
    #[serde(default)]
    pub apply_default_taxes: bool,
}

impl Scenario {
    pub fn from_toml(input: &str) -> Result<Self, BankrecError> {
        let scenario: Scenario =
            toml::from_str(input).map_err(|e| BankrecError::ConfigParse(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Read a scenario file and the open-line CSV it references.
    pub fn load(path: &Path) -> Result<Self, BankrecError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| BankrecError::Io(format!("{}: {e}", path.display())))?;
        let mut scenario = Self::from_toml(&input)?;

        if let Some(file) = scenario.open_lines_file.clone() {
            let csv_path = path.parent().unwrap_or_else(|| Path::new(".")).join(&file);
            let data = std::fs::read_to_string(&csv_path)
                .map_err(|e| BankrecError::Io(format!("{}: {e}", csv_path.display())))?;
            let lines = load_open_lines_csv(&file, &data)?;
            scenario.open_lines.extend(lines);
            scenario.validate()?;
        }

        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), BankrecError> {
        self.context.validate()?;

        let mut seen = BTreeSet::new();
        for line in &self.open_lines {
            if !seen.insert(line.id.as_str()) {
                return Err(BankrecError::Configuration(format!(
                    "duplicate open line id '{}'",
                    line.id
                )));
            }
        }

        let mut movements = BTreeSet::new();
        for mv in &self.movements {
            if !movements.insert(mv.id.as_str()) {
                return Err(BankrecError::Configuration(format!(
                    "duplicate movement id '{}'",
                    mv.id
                )));
            }
        }

        for spec in &self.matches {
            if !movements.contains(spec.movement.as_str()) {
                return Err(BankrecError::Configuration(format!(
                    "match refers to unknown movement '{}'",
                    spec.movement
                )));
            }
        }

        self.rate_table()?;
        Ok(())
    }

    pub fn rate_table(&self) -> Result<RateTable, BankrecError> {
        RateTable::from_rows(self.context.company_currency.clone(), &self.rates)
    }

    pub fn tax_table(&self) -> TaxTable {
        TaxTable::new(self.taxes.clone())
    }
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

/// Load open lines from CSV.
///
/// Required columns: `id`, `account`, `date`, `currency`, `residual`.
/// Optional: `document`, `partner`, `reference`, `residual_balance`,
/// `taxes` (`;`-separated), `discount_percent`, `discount_deadline`.
pub fn load_open_lines_csv(source: &str, csv_data: &str) -> Result<Vec<OpenLine>, BankrecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| BankrecError::Io(e.to_string()))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let position = |name: &str| headers.iter().position(|h| h == name);
    let idx = |name: &str| -> Result<usize, BankrecError> {
        position(name).ok_or_else(|| BankrecError::MissingColumn {
            source: source.into(),
            column: name.into(),
        })
    };

    let id_idx = idx("id")?;
    let account_idx = idx("account")?;
    let date_idx = idx("date")?;
    let currency_idx = idx("currency")?;
    let residual_idx = idx("residual")?;

    let document_idx = position("document");
    let partner_idx = position("partner");
    let reference_idx = position("reference");
    let balance_idx = position("residual_balance");
    let taxes_idx = position("taxes");
    let discount_idx = position("discount_percent");
    let deadline_idx = position("discount_deadline");

    let mut lines = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| BankrecError::Io(e.to_string()))?;
        let id = record.get(id_idx).unwrap_or("").to_string();

        // Empty optional cells read as absent.
        let optional = |i: Option<usize>| i.and_then(|i| record.get(i)).filter(|v| !v.is_empty());
        let parse_err = |value: &str| BankrecError::Parse {
            source: source.into(),
            record_id: id.clone(),
            value: value.into(),
        };
        let date = |value: &str| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| parse_err(value))
        };
        let amount = |value: &str| Decimal::from_str(value).map_err(|_| parse_err(value));

        let residual = amount(record.get(residual_idx).unwrap_or(""))?;
        let residual_balance = optional(balance_idx).map(amount).transpose()?;

        let discount = match (optional(discount_idx), optional(deadline_idx)) {
            (Some(percent), Some(deadline)) => Some(EarlyPaymentDiscount {
                percent: amount(percent)?,
                deadline: date(deadline)?,
            }),
            (None, None) => None,
            (Some(v), None) | (None, Some(v)) => return Err(parse_err(v)),
        };

        let taxes = optional(taxes_idx)
            .map(|v| {
                v.split(';')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let document = optional(document_idx).unwrap_or(&id).to_string();

        lines.push(OpenLine {
            document,
            account: record.get(account_idx).unwrap_or("").to_string(),
            partner: optional(partner_idx).map(str::to_string),
            date: date(record.get(date_idx).unwrap_or(""))?,
            reference: optional(reference_idx).unwrap_or("").to_string(),
            currency: record.get(currency_idx).unwrap_or("").to_string(),
            residual,
            residual_balance,
            installments: Vec::new(),
            discount,
            taxes,
            taxes_from_account: false,
            version: 0,
            id,
        });
    }

    Ok(lines)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRun {
    pub name: String,
    pub outcomes: Vec<MovementOutcome>,
    pub summary: RunSummary,
    /// Exchange entries in the book after the run.
    pub exchange_entries: Vec<ExchangeDifferenceEntry>,
}

/// Propose (and with `commit`, validate) an allocation for every movement.
///
/// A movement that fails is reported as an error outcome; the others proceed.
#[instrument(skip_all, fields(scenario = %scenario.name))]
pub fn run(scenario: &Scenario, commit: bool) -> Result<ScenarioRun, BankrecError> {
    scenario.validate()?;

    let ctx = scenario.context.clone();
    let book = Arc::new(Book::with_lines(&ctx, scenario.open_lines.iter().cloned()));
    for document in &scenario.posted_documents {
        book.post_document(document)?;
    }
    let mut reconciler = Reconciler::new(
        ctx,
        Arc::clone(&book),
        scenario.rate_table()?,
        scenario.tax_table(),
    );

    let outcomes: Vec<MovementOutcome> = scenario
        .movements
        .iter()
        .map(|mv| {
            let spec = scenario.matches.iter().find(|m| m.movement == mv.id);
            process(&mut reconciler, mv, spec, commit).unwrap_or_else(|e| {
                warn!(movement = %mv.id, error = %e, "movement failed");
                MovementOutcome {
                    movement_id: mv.id.clone(),
                    status: MovementStatus::Error,
                    result: None,
                    error: Some(e.to_string()),
                    committed: false,
                }
            })
        })
        .collect();

    let summary = compute_summary(&outcomes);
    info!(
        movements = summary.movements,
        reconciled = summary.reconciled,
        errors = summary.errors,
        "scenario processed"
    );

    Ok(ScenarioRun {
        name: scenario.name.clone(),
        outcomes,
        summary,
        exchange_entries: book.exchange_entries(),
    })
}

fn process(
    reconciler: &mut Reconciler,
    movement: &BankMovement,
    spec: Option<&MatchSpec>,
    commit: bool,
) -> Result<MovementOutcome, BankrecError> {
    let id = movement.id.as_str();
    let mut result = reconciler.add_movement(movement.clone())?;

    match spec {
        Some(spec) => {
            if !spec.open_lines.is_empty() {
                result = reconciler.set_lines(id, &spec.open_lines)?;
            }
            if let Some(account) = &spec.open_balance_account {
                result = reconciler.set_open_balance_account(id, account, spec.apply_default_taxes)?;
            }
        }
        None => {
            if let Some(auto) = reconciler.try_auto_reconcile(id)? {
                result = auto;
            }
        }
    }

    if commit {
        reconciler.validate(id)?;
        if let Some(committed) = reconciler.proposal(id) {
            result = committed.clone();
        }
    }

    Ok(MovementOutcome {
        movement_id: id.to_string(),
        status: MovementStatus::of(&result),
        result: Some(result),
        error: None,
        committed: commit,
    })
}
