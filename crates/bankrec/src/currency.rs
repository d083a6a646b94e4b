//! Currency conversion service.
//!
//! The allocator only sees the [`CurrencyConverter`] trait. [`RateTable`] is the
//! in-process implementation loaded from scenario files.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BankrecError;

pub trait CurrencyConverter {
    /// Convert `amount` at the rate effective on `date`. The result is not rounded.
    fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Decimal, BankrecError>;
}

/// One rate observation: units of `currency` per one unit of company currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRow {
    pub currency: String,
    pub date: NaiveDate,
    pub rate: Decimal,
}

/// Dated rates against the company currency. The latest rate on or before
/// the requested date applies.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    company_currency: String,
    rates: BTreeMap<String, BTreeMap<NaiveDate, Decimal>>,
}

impl RateTable {
    pub fn new(company_currency: impl Into<String>) -> Self {
        Self {
            company_currency: company_currency.into(),
            rates: BTreeMap::new(),
        }
    }

    pub fn from_rows(
        company_currency: impl Into<String>,
        rows: &[RateRow],
    ) -> Result<Self, BankrecError> {
        let mut table = Self::new(company_currency);
        for row in rows {
            table.insert(&row.currency, row.date, row.rate)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, currency: &str, date: NaiveDate, rate: Decimal) -> Result<(), BankrecError> {
        if rate <= Decimal::ZERO {
            return Err(BankrecError::Configuration(format!(
                "rate for {currency} on {date} must be positive, got {rate}"
            )));
        }
        self.rates
            .entry(currency.to_string())
            .or_default()
            .insert(date, rate);
        Ok(())
    }

    pub fn with_rate(mut self, currency: &str, date: NaiveDate, rate: Decimal) -> Result<Self, BankrecError> {
        self.insert(currency, date, rate)?;
        Ok(self)
    }

    /// Units of `currency` per one company unit on `date`. The company currency is always 1.
    pub fn rate(&self, currency: &str, date: NaiveDate) -> Option<Decimal> {
        if currency == self.company_currency {
            return Some(Decimal::ONE);
        }
        self.rates
            .get(currency)?
            .range(..=date)
            .next_back()
            .map(|(_, rate)| *rate)
    }
}

impl CurrencyConverter for RateTable {
    fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Decimal, BankrecError> {
        if from == to {
            return Ok(amount);
        }
        let missing = || BankrecError::CurrencyMismatch {
            from: from.to_string(),
            to: to.to_string(),
            date,
        };
        let from_rate = self.rate(from, date).ok_or_else(missing)?;
        let to_rate = self.rate(to, date).ok_or_else(missing)?;
        amount
            .checked_div(from_rate)
            .and_then(|company| company.checked_mul(to_rate))
            .ok_or_else(missing)
    }
}
