//! Residual amount resolution.
//!
//! Turns open lines into the ordered candidate amounts the allocation engine
//! consumes: one per unpaid installment (oldest due first), or one for the
//! whole line, optionally with an early-payment-discounted amount.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::config::ReconciliationContext;
use crate::model::{CandidateRef, Installment, OpenLine};
use crate::terms::PaymentTermSchedule;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualAmount {
    pub amount: Decimal,
    pub currency: String,
}

/// One amount the engine may settle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualCandidate {
    pub open_line_id: String,
    pub document: String,
    /// 1-based position in the payment-term plan.
    pub installment: Option<u32>,
    pub due_date: NaiveDate,
    pub account: String,
    pub label: String,
    pub currency: String,
    /// Unpaid amount in `currency`.
    pub amount: Decimal,
    /// Company-currency value of `amount` at booking-time rates.
    pub balance: Decimal,
    /// Discounted amount in `currency`, when an early-payment discount applies.
    pub discounted: Option<Decimal>,
    /// Explicit taxes, or the account's default taxes when the line asks for them.
    pub taxes: Vec<String>,
}

impl ResidualCandidate {
    pub fn reference(&self) -> CandidateRef {
        CandidateRef {
            open_line_id: self.open_line_id.clone(),
            installment: self.installment,
        }
    }
}

pub struct ResidualResolver<'a> {
    ctx: &'a ReconciliationContext,
    schedule: &'a dyn PaymentTermSchedule,
}

impl<'a> ResidualResolver<'a> {
    pub fn new(ctx: &'a ReconciliationContext, schedule: &'a dyn PaymentTermSchedule) -> Self {
        Self { ctx, schedule }
    }

    /// Stored residual of the line, net of prior partial payments.
    pub fn resolve(&self, line: &OpenLine) -> ResidualAmount {
        ResidualAmount {
            amount: line.residual,
            currency: line.currency.clone(),
        }
    }

    /// Candidates for every line, preserving the caller's line order.
    pub fn candidates_for(
        &self,
        lines: &[OpenLine],
        as_of: Option<NaiveDate>,
    ) -> Vec<ResidualCandidate> {
        lines
            .iter()
            .flat_map(|line| self.candidates(line, as_of))
            .collect()
    }

    /// Candidates of one line. A missing `as_of` disables the early-payment discount.
    pub fn candidates(&self, line: &OpenLine, as_of: Option<NaiveDate>) -> Vec<ResidualCandidate> {
        if self.ctx.is_zero(line.residual, &line.currency) {
            return Vec::new();
        }

        let taxes = if line.taxes_from_account {
            self.ctx.default_taxes(&line.account).to_vec()
        } else {
            line.taxes.clone()
        };
        let base = ResidualCandidate {
            open_line_id: line.id.clone(),
            document: line.document.clone(),
            installment: None,
            due_date: line.date,
            account: line.account.clone(),
            label: line.label().to_string(),
            currency: line.currency.clone(),
            amount: line.residual,
            balance: line.booked_balance(),
            discounted: None,
            taxes,
        };

        let plan = self.schedule.installments(line);
        if !plan.is_empty() {
            if let Some(split) = self.split_installments(line, &plan, &base) {
                return split;
            }
            debug!(open_line = %line.id, "installment plan does not cover residual; using whole line");
            return vec![base];
        }

        let discounted = match (&line.discount, as_of) {
            (Some(epd), Some(date)) if date <= epd.deadline => {
                let factor = Decimal::ONE - epd.percent / Decimal::ONE_HUNDRED;
                Some(self.ctx.round(line.residual * factor, &line.currency))
            }
            _ => None,
        };

        vec![ResidualCandidate { discounted, ..base }]
    }

    fn split_installments(
        &self,
        line: &OpenLine,
        plan: &[Installment],
        base: &ResidualCandidate,
    ) -> Option<Vec<ResidualCandidate>> {
        let total: Decimal = plan.iter().map(|i| i.amount).sum();
        if total.is_sign_negative() != line.residual.is_sign_negative()
            || total.abs() < line.residual.abs()
        {
            return None;
        }

        // Already-paid amount is credited to the oldest installments first.
        let mut paid = (total - line.residual).abs();
        let mut unpaid = Vec::new();
        for (idx, inst) in plan.iter().enumerate() {
            let covered = paid.min(inst.amount.abs());
            paid -= covered;
            let left = inst.amount - covered * sign(inst.amount);
            if !self.ctx.is_zero(left, &line.currency) {
                unpaid.push((idx as u32 + 1, inst.due_date, left));
            }
        }

        let booked = line.booked_balance();
        let mut booked_left = booked;
        let last = unpaid.len().saturating_sub(1);
        let out = unpaid
            .into_iter()
            .enumerate()
            .map(|(pos, (seq, due_date, amount))| {
                let balance = if pos == last {
                    booked_left
                } else {
                    self.ctx.round_company(booked * amount / line.residual)
                };
                booked_left -= balance;
                ResidualCandidate {
                    installment: Some(seq),
                    due_date,
                    amount,
                    balance,
                    ..base.clone()
                }
            })
            .collect();
        Some(out)
    }
}

fn sign(amount: Decimal) -> Decimal {
    if amount.is_sign_negative() {
        -Decimal::ONE
    } else {
        Decimal::ONE
    }
}
