use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::ReconciliationContext;
use crate::currency::CurrencyConverter;
use crate::error::BankrecError;
use crate::exchange::ExchangeDifferenceEntry;
use crate::model::{
    AllocationLine, BankMovement, CandidateMatch, CandidateRef, CandidateWarning, LineKind,
    MatchStatus,
};
use crate::residual::ResidualCandidate;
use crate::tax::{expand_settlement, TaxEngine};

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Amount of the movement still to be allocated, in company currency and in
/// the movement's own currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub balance: Decimal,
    pub amount_currency: Decimal,
}

impl Budget {
    pub fn of(movement: &BankMovement) -> Self {
        Self {
            balance: movement.amount,
            amount_currency: movement.amount_currency(),
        }
    }
}

/// The bank side of every proposal.
pub fn liquidity_line(ctx: &ReconciliationContext, movement: &BankMovement) -> AllocationLine {
    AllocationLine::new(
        "liquidity",
        LineKind::Liquidity,
        movement.account.clone(),
        movement.amount,
        movement.amount_currency(),
        movement.currency(&ctx.company_currency),
    )
    .with_label(movement.label.clone())
}

/// Resolves the write-off account for payment-tolerance differences.
pub trait FeesAccountProvider {
    fn fees_account(&self, journal: &str) -> String;
}

impl FeesAccountProvider for ReconciliationContext {
    fn fees_account(&self, journal: &str) -> String {
        self.journals
            .get(journal)
            .and_then(|j| j.fees.clone())
            .unwrap_or_else(|| format!("{}-{journal}", self.accounts.fees_prefix))
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Counterpart lines produced for the candidates, plus what is left over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub lines: Vec<AllocationLine>,
    pub matches: Vec<CandidateMatch>,
    pub untouched: Vec<CandidateRef>,
    pub exchange_differences: Vec<ExchangeDifferenceEntry>,
    pub warnings: Vec<CandidateWarning>,
    pub remaining: Budget,
}

impl Allocation {
    pub fn fully_reconciled(&self, ctx: &ReconciliationContext) -> bool {
        ctx.is_zero(self.remaining.balance, &ctx.company_currency)
    }
}

/// A candidate valued at the movement date.
struct Valued {
    /// In the movement currency.
    fx: Decimal,
    /// In company currency.
    co: Decimal,
    /// Discounted amount in company currency.
    discounted_co: Option<Decimal>,
}

struct Decision {
    /// Company amount credited to the candidate's account.
    settled: Decimal,
    /// Same, in the candidate's currency.
    paid_own: Decimal,
    full: bool,
    discounted: bool,
    extra: Option<AllocationLine>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AllocationEngine<'a> {
    ctx: &'a ReconciliationContext,
    converter: &'a dyn CurrencyConverter,
    taxes: &'a dyn TaxEngine,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(
        ctx: &'a ReconciliationContext,
        converter: &'a dyn CurrencyConverter,
        taxes: &'a dyn TaxEngine,
    ) -> Self {
        Self { ctx, converter, taxes }
    }

    /// Consume `budget` against `candidates` in order.
    ///
    /// Processing stops as soon as the budget reaches zero; later candidates are
    /// reported as untouched. A candidate whose currency cannot be converted is
    /// skipped with a warning.
    #[instrument(skip_all, fields(movement = %movement.id))]
    pub fn allocate(
        &self,
        movement: &BankMovement,
        budget: Budget,
        candidates: &[ResidualCandidate],
        fees: &dyn FeesAccountProvider,
    ) -> Result<Allocation, BankrecError> {
        let company = self.ctx.company_currency.as_str();
        let mv_currency = movement.currency(company).to_string();
        let tolerance = if candidates.len() == 1 {
            self.ctx.tolerance_fraction()
        } else {
            None
        };

        let mut out = Allocation {
            lines: Vec::new(),
            matches: Vec::new(),
            untouched: Vec::new(),
            exchange_differences: Vec::new(),
            warnings: Vec::new(),
            remaining: budget,
        };

        for (idx, cand) in candidates.iter().enumerate() {
            if self.ctx.is_zero(out.remaining.balance, company) {
                out.untouched
                    .extend(candidates[idx..].iter().map(ResidualCandidate::reference));
                break;
            }

            let valued = match self.value(movement, &mv_currency, cand) {
                Ok(v) => v,
                Err(e) => {
                    warn!(candidate = %cand.reference(), error = %e, "skipping candidate");
                    out.warnings.push(CandidateWarning {
                        candidate: cand.reference(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if self.ctx.is_zero(valued.co, company) {
                out.untouched.push(cand.reference());
                continue;
            }

            let decision =
                self.decide(movement, &mv_currency, cand, &valued, out.remaining, tolerance, fees)?;
            self.apply(movement, &mv_currency, cand, &valued, decision, &mut out)?;
        }

        Ok(out)
    }

    fn value(
        &self,
        movement: &BankMovement,
        mv_currency: &str,
        cand: &ResidualCandidate,
    ) -> Result<Valued, BankrecError> {
        let (fx, co) = self.value_amount(movement, mv_currency, cand.amount, &cand.currency)?;
        let discounted_co = match cand.discounted {
            Some(disc) => Some(self.value_amount(movement, mv_currency, disc, &cand.currency)?.1),
            None => None,
        };
        Ok(Valued { fx, co, discounted_co })
    }

    /// Convert first, round once in the target currency.
    fn value_amount(
        &self,
        movement: &BankMovement,
        mv_currency: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<(Decimal, Decimal), BankrecError> {
        let company = self.ctx.company_currency.as_str();
        let fx = if currency == mv_currency {
            amount
        } else {
            let raw = self.converter.convert(amount, currency, mv_currency, movement.date)?;
            self.ctx.round(raw, mv_currency)
        };
        let co = if mv_currency == company {
            fx
        } else if currency == company {
            amount
        } else if let Some(rate) = movement.implied_rate() {
            self.ctx.round_company(fx * rate)
        } else {
            let raw = self.converter.convert(amount, currency, company, movement.date)?;
            self.ctx.round_company(raw)
        };
        Ok((fx, co))
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        movement: &BankMovement,
        mv_currency: &str,
        cand: &ResidualCandidate,
        valued: &Valued,
        remaining: Budget,
        tolerance: Option<Decimal>,
        fees: &dyn FeesAccountProvider,
    ) -> Result<Decision, BankrecError> {
        let company = self.ctx.company_currency.as_str();
        let full = |extra: Option<AllocationLine>, discounted: bool| Decision {
            settled: valued.co,
            paid_own: cand.amount,
            full: true,
            discounted,
            extra,
        };

        // Opposite sign (credit note, refund): consumed in full, enlarges the budget.
        if valued.co.is_sign_negative() != remaining.balance.is_sign_negative() {
            return Ok(full(None, false));
        }

        let available = remaining.balance.abs();
        let residual = valued.co.abs();

        if let Some(disc) = valued.discounted_co {
            let unit = self.ctx.rounding_unit(company);
            if available < residual && available >= disc.abs() - unit {
                let balance = valued.co - remaining.balance;
                let account = self.ctx.discount_account(balance)?;
                let amount_currency = if cand.currency == company {
                    balance
                } else {
                    self.ctx.round(cand.amount * balance / valued.co, &cand.currency)
                };
                let line = AllocationLine::new(
                    format!("discount:{}", cand.reference()),
                    LineKind::EarlyPaymentDiscount,
                    account,
                    balance,
                    amount_currency,
                    cand.currency.clone(),
                )
                .with_label(format!("Early payment discount: {}", cand.label));
                return Ok(full(Some(line), true));
            }
        }

        // The movement and the candidate share a foreign currency and match there
        // exactly: settle in full even if the company-currency values drift apart.
        if mv_currency != company
            && cand.currency == mv_currency
            && valued.fx.abs() == remaining.amount_currency.abs()
        {
            return Ok(Decision {
                settled: remaining.balance,
                ..full(None, false)
            });
        }

        let write_off = |balance: Decimal| {
            AllocationLine::new(
                "writeoff:fees",
                LineKind::WriteOff,
                fees.fees_account(&movement.journal),
                balance,
                balance,
                company,
            )
            .with_label(format!("Payment difference: {}", cand.label))
        };

        if available >= residual {
            let excess = remaining.balance - valued.co;
            if let Some(tol) = tolerance {
                if !self.ctx.is_zero(excess, company) && excess.abs() <= tol * residual {
                    return Ok(full(Some(write_off(-excess)), false));
                }
            }
            return Ok(full(None, false));
        }

        let gap = valued.co - remaining.balance;
        if let Some(tol) = tolerance {
            if gap.abs() <= tol * residual {
                return Ok(full(Some(write_off(gap)), false));
            }
        }

        let paid_own = if cand.currency == mv_currency {
            remaining.amount_currency
        } else if cand.currency == company {
            remaining.balance
        } else {
            self.ctx
                .round(cand.amount * remaining.balance / valued.co, &cand.currency)
        };
        let paid_own = if paid_own.abs() > cand.amount.abs() {
            cand.amount
        } else {
            paid_own
        };

        Ok(Decision {
            settled: remaining.balance,
            paid_own,
            full: false,
            discounted: false,
            extra: None,
        })
    }

    fn apply(
        &self,
        movement: &BankMovement,
        mv_currency: &str,
        cand: &ResidualCandidate,
        valued: &Valued,
        decision: Decision,
        out: &mut Allocation,
    ) -> Result<(), BankrecError> {
        let company = self.ctx.company_currency.as_str();
        let reference = cand.reference();

        let mut line = AllocationLine::new(
            format!("settle:{reference}"),
            LineKind::Settlement,
            cand.account.clone(),
            -decision.settled,
            -decision.paid_own,
            cand.currency.clone(),
        )
        .with_label(cand.label.clone());
        line.open_line_id = Some(cand.open_line_id.clone());
        line.installment = cand.installment;
        line.reconciled = decision.full;

        // The line keeps the full amount taken; taxes are computed on it.
        line.taxes = cand.taxes.clone();
        out.lines.extend(expand_settlement(self.ctx, self.taxes, line)?);

        let (record, exchange) = self.record(
            movement,
            cand,
            valued.co,
            decision.settled,
            decision.paid_own,
            decision.full,
            decision.discounted,
        );
        out.exchange_differences.extend(exchange);

        let extra_balance = decision.extra.as_ref().map(|l| l.balance).unwrap_or_default();
        let consumed = decision.settled - extra_balance;

        debug!(
            candidate = %reference,
            settled = %decision.settled,
            full = decision.full,
            discounted = decision.discounted,
            "allocated candidate"
        );

        out.matches.push(record);
        out.lines.extend(decision.extra);

        out.remaining.balance -= consumed;
        out.remaining.amount_currency = if self.ctx.is_zero(out.remaining.balance, company) {
            out.remaining.balance = Decimal::ZERO;
            Decimal::ZERO
        } else if cand.currency == mv_currency {
            out.remaining.amount_currency - decision.paid_own
        } else {
            out.remaining.amount_currency
                - self.ctx.round(valued.fx * consumed / valued.co, mv_currency)
        };

        Ok(())
    }

    /// Match record for a settlement the user forced on `cand`: `settled` in
    /// company currency, `paid_own` in the candidate's currency.
    pub fn forced_match(
        &self,
        movement: &BankMovement,
        cand: &ResidualCandidate,
        settled: Decimal,
        paid_own: Decimal,
    ) -> Result<(CandidateMatch, Option<ExchangeDifferenceEntry>), BankrecError> {
        let mv_currency = movement.currency(&self.ctx.company_currency).to_string();
        let valued = self.value(movement, &mv_currency, cand)?;
        let full = paid_own.abs() >= cand.amount.abs();
        Ok(self.record(movement, cand, valued.co, settled, paid_own, full, false))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        movement: &BankMovement,
        cand: &ResidualCandidate,
        residual_value: Decimal,
        settled: Decimal,
        paid_own: Decimal,
        full: bool,
        discounted: bool,
    ) -> (CandidateMatch, Option<ExchangeDifferenceEntry>) {
        let company = self.ctx.company_currency.as_str();
        let reference = cand.reference();

        let paid_booked = if full {
            cand.balance
        } else {
            self.ctx.round_company(cand.balance * paid_own / cand.amount)
        };

        let mut exchange = None;
        if full && cand.currency != company {
            let difference = settled - cand.balance;
            if !self.ctx.is_zero(difference, company) {
                debug!(candidate = %reference, %difference, "exchange difference");
                exchange = Some(ExchangeDifferenceEntry::draft(
                    format!("exch:{}:{reference}", movement.id),
                    movement.id.clone(),
                    cand.open_line_id.clone(),
                    cand.document.clone(),
                    format!("partial:{}:{reference}", movement.id),
                    movement.date,
                    difference,
                    &cand.account,
                    self.ctx.exchange_account(-difference),
                    &cand.currency,
                ));
            }
        }

        let record = CandidateMatch {
            candidate: reference,
            status: if full { MatchStatus::Full } else { MatchStatus::Partial },
            currency: cand.currency.clone(),
            residual_before: cand.amount,
            residual_value,
            paid: paid_own,
            paid_booked,
            settled,
            discounted,
        };
        (record, exchange)
    }
}
