use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BankrecError;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// `Draft` on creation, then `Posted` with the parent document, or
/// `Discarded` if the reconciliation is undone first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Draft,
    Posted,
    Discarded,
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Posted => write!(f, "posted"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeLine {
    pub account: String,
    pub balance: Decimal,
    /// Currency of the settled open line. Exchange lines carry no foreign amount.
    pub currency: String,
}

/// Gain/loss entry booked when a foreign open line is settled at a rate
/// different from its booking rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDifferenceEntry {
    pub id: String,
    pub movement_id: String,
    pub open_line_id: String,
    pub document: String,
    /// Partial reconciliation this entry depends on.
    pub partial_id: String,
    pub date: NaiveDate,
    /// Company-currency delta booked on the open line's account.
    pub amount: Decimal,
    pub lines: Vec<ExchangeLine>,
    pub state: ExchangeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<String>,
}

impl ExchangeDifferenceEntry {
    /// Draft entry with two balancing lines: `amount` on the open line's account,
    /// `-amount` on the gain/loss account.
    #[allow(clippy::too_many_arguments)]
    pub fn draft(
        id: impl Into<String>,
        movement_id: impl Into<String>,
        open_line_id: impl Into<String>,
        document: impl Into<String>,
        partial_id: impl Into<String>,
        settlement_date: NaiveDate,
        amount: Decimal,
        open_line_account: &str,
        exchange_account: &str,
        currency: &str,
    ) -> Self {
        Self {
            id: id.into(),
            movement_id: movement_id.into(),
            open_line_id: open_line_id.into(),
            document: document.into(),
            partial_id: partial_id.into(),
            date: end_of_month(settlement_date),
            amount,
            lines: vec![
                ExchangeLine {
                    account: open_line_account.to_string(),
                    balance: amount,
                    currency: currency.to_string(),
                },
                ExchangeLine {
                    account: exchange_account.to_string(),
                    balance: -amount,
                    currency: currency.to_string(),
                },
            ],
            state: ExchangeState::Draft,
            reverses: None,
        }
    }

    pub fn post(&mut self) -> Result<(), BankrecError> {
        self.transition(ExchangeState::Draft, ExchangeState::Posted)
    }

    pub fn discard(&mut self) -> Result<(), BankrecError> {
        self.transition(ExchangeState::Draft, ExchangeState::Discarded)
    }

    fn transition(&mut self, from: ExchangeState, to: ExchangeState) -> Result<(), BankrecError> {
        if self.state != from {
            return Err(BankrecError::InvalidTransition {
                entry_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Posted counter-entry cancelling a posted entry.
    pub fn reversal(&self, id: impl Into<String>) -> Result<Self, BankrecError> {
        if self.state != ExchangeState::Posted {
            return Err(BankrecError::InvalidTransition {
                entry_id: self.id.clone(),
                from: self.state,
                to: ExchangeState::Discarded,
            });
        }
        Ok(Self {
            id: id.into(),
            movement_id: self.movement_id.clone(),
            open_line_id: self.open_line_id.clone(),
            document: self.document.clone(),
            partial_id: self.partial_id.clone(),
            date: self.date,
            amount: -self.amount,
            lines: self
                .lines
                .iter()
                .map(|l| ExchangeLine {
                    account: l.account.clone(),
                    balance: -l.balance,
                    currency: l.currency.clone(),
                })
                .collect(),
            state: ExchangeState::Posted,
            reverses: Some(self.id.clone()),
        })
    }

    pub fn is_balanced(&self) -> bool {
        self.lines.iter().map(|l| l.balance).sum::<Decimal>().is_zero()
    }
}

/// Last calendar day of `date`'s month.
pub fn end_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn entry() -> ExchangeDifferenceEntry {
        ExchangeDifferenceEntry::draft(
            "exch:st_1:INV1",
            "st_1",
            "INV1",
            "INV/2026/0001",
            "partial:st_1:INV1",
            d("2026-02-10"),
            dec!(-100),
            "411000",
            "666000",
            "USD",
        )
    }

    #[test]
    fn end_of_month_handles_leap_and_december() {
        assert_eq!(end_of_month(d("2024-02-10")), d("2024-02-29"));
        assert_eq!(end_of_month(d("2026-02-28")), d("2026-02-28"));
        assert_eq!(end_of_month(d("2026-12-01")), d("2026-12-31"));
    }

    #[test]
    fn draft_is_dated_end_of_month_and_balanced() {
        let e = entry();
        assert_eq!(e.state, ExchangeState::Draft);
        assert_eq!(e.date, d("2026-02-28"));
        assert!(e.is_balanced());
        assert_eq!(e.lines[1].balance, dec!(100));
    }

    #[test]
    fn draft_can_post_or_discard_once() {
        let mut posted = entry();
        posted.post().unwrap();
        assert_eq!(posted.state, ExchangeState::Posted);
        assert!(posted.discard().is_err());

        let mut discarded = entry();
        discarded.discard().unwrap();
        let err = discarded.post().unwrap_err();
        assert_eq!(
            err.to_string(),
            "exchange entry 'exch:st_1:INV1': cannot go from discarded to posted"
        );
    }

    #[test]
    fn reversal_requires_posted() {
        let draft = entry();
        assert!(draft.reversal("rev").is_err());

        let mut posted = entry();
        posted.post().unwrap();
        let rev = posted.reversal("rev").unwrap();
        assert_eq!(rev.state, ExchangeState::Posted);
        assert_eq!(rev.amount, dec!(100));
        assert_eq!(rev.reverses.as_deref(), Some("exch:st_1:INV1"));
        assert!(rev.is_balanced());
    }
}
