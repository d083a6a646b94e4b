//! Tax expansion.
//!
//! Amounts handed to the engine are tax-inclusive. Free lines (manual, open
//! balance) are split into a base and one line per tax, keeping the total.
//! Settlement lines keep the full amount taken from the open line; their tax
//! is moved from the tax's transition account to its final account by a
//! balanced pair of lines.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::ReconciliationContext;
use crate::error::BankrecError;
use crate::model::{AllocationLine, LineKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub tax: String,
    pub account: String,
    /// Signed, same sign as the taxed amount.
    pub amount: Decimal,
    #[serde(default)]
    pub tag: Option<String>,
    /// Account holding the tax until the open line is paid.
    #[serde(default)]
    pub transition_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxComputation {
    pub base: Decimal,
    pub tax_lines: Vec<TaxLine>,
}

impl TaxComputation {
    pub fn total_tax(&self) -> Decimal {
        self.tax_lines.iter().map(|t| t.amount).sum()
    }
}

pub trait TaxEngine {
    /// Split `amount * partial_factor` into base and tax lines, rounded to `decimal_places`.
    fn compute_taxes(
        &self,
        amount: Decimal,
        taxes: &[String],
        partial_factor: Decimal,
        decimal_places: u32,
    ) -> Result<TaxComputation, BankrecError>;
}

/// Percentage tax rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRule {
    /// Rate in percent (20 = 20%).
    pub rate: Decimal,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Required for taxes on open lines settled by a payment.
    #[serde(default)]
    pub transition_account: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaxTable {
    rules: BTreeMap<String, TaxRule>,
}

impl TaxTable {
    pub fn new(rules: BTreeMap<String, TaxRule>) -> Self {
        Self { rules }
    }

    pub fn with_tax(mut self, name: &str, rule: TaxRule) -> Self {
        self.rules.insert(name.to_string(), rule);
        self
    }

    fn rule(&self, name: &str) -> Result<(&TaxRule, &str), BankrecError> {
        let rule = self
            .rules
            .get(name)
            .ok_or_else(|| BankrecError::Configuration(format!("unknown tax '{name}'")))?;
        let account = rule
            .account
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| BankrecError::Configuration(format!("tax '{name}' has no account")))?;
        Ok((rule, account))
    }
}

impl TaxEngine for TaxTable {
    fn compute_taxes(
        &self,
        amount: Decimal,
        taxes: &[String],
        partial_factor: Decimal,
        decimal_places: u32,
    ) -> Result<TaxComputation, BankrecError> {
        let round = |v: Decimal| v.round_dp_with_strategy(decimal_places, RoundingStrategy::MidpointAwayFromZero);

        // Resolve every rule before computing anything.
        let rules = taxes
            .iter()
            .map(|name| self.rule(name).map(|(rule, account)| (name, rule, account)))
            .collect::<Result<Vec<_>, _>>()?;

        let gross = round(amount * partial_factor);
        let total_rate: Decimal = rules.iter().map(|(_, rule, _)| rule.rate).sum();
        let divisor = Decimal::ONE + total_rate / Decimal::ONE_HUNDRED;
        if divisor.is_zero() {
            return Err(BankrecError::Configuration(
                "tax rates sum to -100%".into(),
            ));
        }
        let base = round(gross / divisor);

        let mut tax_lines: Vec<TaxLine> = rules
            .iter()
            .map(|(name, rule, account)| TaxLine {
                tax: (*name).clone(),
                account: (*account).to_string(),
                amount: round(base * rule.rate / Decimal::ONE_HUNDRED),
                tag: rule.tag.clone(),
                transition_account: rule.transition_account.clone().filter(|a| !a.is_empty()),
            })
            .collect();

        // Rounding residue goes on the last tax line.
        let residue = gross - base - tax_lines.iter().map(|t| t.amount).sum::<Decimal>();
        if let Some(last) = tax_lines.last_mut() {
            last.amount += residue;
        }

        Ok(TaxComputation { base, tax_lines })
    }
}

/// Tax line derived from `line`, with `amount_currency` prorated when the
/// line is in a foreign currency.
fn derived_line(
    ctx: &ReconciliationContext,
    line: &AllocationLine,
    id: String,
    tax: &TaxLine,
    account: &str,
    amount: Decimal,
) -> AllocationLine {
    let amount_currency = if line.currency == ctx.company_currency {
        amount
    } else if line.balance.is_zero() {
        Decimal::ZERO
    } else {
        ctx.round(amount * line.amount_currency / line.balance, &line.currency)
    };
    let mut out = AllocationLine::new(id, LineKind::Tax, account, amount, amount_currency, line.currency.clone())
        .with_label(format!("{} ({})", line.label, tax.tax));
    out.tax_origin = Some(tax.tax.clone());
    out.tax_tags = tax.tag.iter().cloned().collect();
    out.reconcile_model = line.reconcile_model.clone();
    out.manually_edited = line.manually_edited;
    out
}

/// Split a tax-bearing line into its base line and one line per tax.
///
/// `line.balance` / `line.amount_currency` are the totals; the returned base
/// line keeps `taxes`, each tax line carries `tax_origin`.
pub fn split_line(
    ctx: &ReconciliationContext,
    line: AllocationLine,
    computation: &TaxComputation,
) -> Vec<AllocationLine> {
    let tax_lines: Vec<AllocationLine> = computation
        .tax_lines
        .iter()
        .map(|tax| derived_line(ctx, &line, format!("{}:tax:{}", line.id, tax.tax), tax, &tax.account, tax.amount))
        .collect();

    let mut base = line;
    base.balance -= computation.total_tax();
    base.amount_currency -= tax_lines.iter().map(|l| l.amount_currency).sum::<Decimal>();
    let mut out = Vec::with_capacity(1 + tax_lines.len());
    out.push(base);
    out.extend(tax_lines);
    out
}

/// Expand `line.taxes` on the line's full amount. Lines without taxes pass through.
pub fn expand_line(
    ctx: &ReconciliationContext,
    engine: &dyn TaxEngine,
    line: AllocationLine,
) -> Result<Vec<AllocationLine>, BankrecError> {
    if line.taxes.is_empty() {
        return Ok(vec![line]);
    }
    let computation = compute_on(ctx, engine, &line)?;
    Ok(split_line(ctx, line, &computation))
}

/// Expand `line.taxes` on a settlement line. The line keeps its amount; each
/// tax adds `{id}:tax:{TAX}` on the tax account and
/// `{id}:tax:{TAX}:transition` with the opposite amount on the transition
/// account.
pub fn expand_settlement(
    ctx: &ReconciliationContext,
    engine: &dyn TaxEngine,
    line: AllocationLine,
) -> Result<Vec<AllocationLine>, BankrecError> {
    if line.taxes.is_empty() {
        return Ok(vec![line]);
    }
    let computation = compute_on(ctx, engine, &line)?;

    let mut out = Vec::with_capacity(1 + 2 * computation.tax_lines.len());
    for tax in &computation.tax_lines {
        let transition = tax.transition_account.as_deref().ok_or_else(|| {
            BankrecError::Configuration(format!("tax '{}' has no transition account", tax.tax))
        })?;
        let id = format!("{}:tax:{}", line.id, tax.tax);
        let transition_id = format!("{id}:transition");
        out.push(derived_line(ctx, &line, id, tax, &tax.account, tax.amount));
        out.push(derived_line(ctx, &line, transition_id, tax, transition, -tax.amount));
    }
    out.insert(0, line);
    Ok(out)
}

fn compute_on(
    ctx: &ReconciliationContext,
    engine: &dyn TaxEngine,
    line: &AllocationLine,
) -> Result<TaxComputation, BankrecError> {
    engine.compute_taxes(
        line.balance,
        &line.taxes,
        Decimal::ONE,
        ctx.decimal_places(&ctx.company_currency),
    )
}
