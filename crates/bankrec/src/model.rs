use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeDifferenceEntry;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Amount of a bank movement expressed in a currency other than the company's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignAmount {
    pub amount: Decimal,
    pub currency: String,
}

/// One bank statement transaction line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankMovement {
    pub id: String,
    pub journal: String,
    pub date: NaiveDate,
    /// Signed amount in company currency. Positive = money received.
    pub amount: Decimal,
    #[serde(default)]
    pub foreign: Option<ForeignAmount>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub partner: Option<String>,
    /// Liquidity account of the bank journal.
    pub account: String,
    /// Overrides the journal / company suspense account.
    #[serde(default)]
    pub suspense_account: Option<String>,
}

impl BankMovement {
    /// Currency the bank actually moved: the foreign currency if set, else the company currency.
    pub fn currency<'a>(&'a self, company_currency: &'a str) -> &'a str {
        self.foreign
            .as_ref()
            .map(|f| f.currency.as_str())
            .unwrap_or(company_currency)
    }

    /// Amount in [`BankMovement::currency`].
    pub fn amount_currency(&self) -> Decimal {
        self.foreign.as_ref().map(|f| f.amount).unwrap_or(self.amount)
    }

    /// Company units per unit of the movement currency, as implied by the statement itself.
    pub fn implied_rate(&self) -> Option<Decimal> {
        let foreign = self.foreign.as_ref()?;
        if foreign.amount.is_zero() {
            return None;
        }
        Some(self.amount / foreign.amount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyPaymentDiscount {
    /// Discount in percent (2 = 2%).
    pub percent: Decimal,
    pub deadline: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub due_date: NaiveDate,
    /// Signed amount in the open line's currency.
    pub amount: Decimal,
}

/// An unpaid receivable/payable line eligible for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenLine {
    pub id: String,
    /// Parent accounting document (invoice, bill). Drives exchange-entry posting.
    #[serde(default)]
    pub document: String,
    pub account: String,
    #[serde(default)]
    pub partner: Option<String>,
    pub date: NaiveDate,
    /// Reference the auto-matcher looks for in statement labels.
    #[serde(default)]
    pub reference: String,
    pub currency: String,
    /// Unpaid amount in the line's own currency, net of prior partial payments.
    pub residual: Decimal,
    /// Unpaid amount in company currency at booking-time rates.
    /// Omitted for lines already in company currency.
    #[serde(default)]
    pub residual_balance: Option<Decimal>,
    #[serde(default)]
    pub installments: Vec<Installment>,
    #[serde(default)]
    pub discount: Option<EarlyPaymentDiscount>,
    #[serde(default)]
    pub taxes: Vec<String>,
    /// Use the default taxes of `account` instead of `taxes`.
    #[serde(default)]
    pub taxes_from_account: bool,
    #[serde(default)]
    pub version: u64,
}

impl OpenLine {
    pub fn booked_balance(&self) -> Decimal {
        self.residual_balance.unwrap_or(self.residual)
    }

    pub fn label(&self) -> &str {
        if self.reference.is_empty() {
            &self.id
        } else {
            &self.reference
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Liquidity,
    Settlement,
    Tax,
    EarlyPaymentDiscount,
    WriteOff,
    Manual,
    OpenBalance,
}

impl std::fmt::Display for LineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Liquidity => write!(f, "liquidity"),
            Self::Settlement => write!(f, "settlement"),
            Self::Tax => write!(f, "tax"),
            Self::EarlyPaymentDiscount => write!(f, "early_payment_discount"),
            Self::WriteOff => write!(f, "write_off"),
            Self::Manual => write!(f, "manual"),
            Self::OpenBalance => write!(f, "open_balance"),
        }
    }
}

/// One journal item of the proposed bank entry.
///
/// A line either carries `taxes` (it is a tax base) or `tax_origin`
/// (it is the result of a tax), never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub id: String,
    pub kind: LineKind,
    pub account: String,
    pub label: String,
    /// Amount in company currency.
    pub balance: Decimal,
    /// Amount in `currency`.
    pub amount_currency: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taxes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tax_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installment: Option<u32>,
    pub reconciled: bool,
    pub manually_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_model: Option<String>,
}

impl AllocationLine {
    pub fn new(
        id: impl Into<String>,
        kind: LineKind,
        account: impl Into<String>,
        balance: Decimal,
        amount_currency: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            account: account.into(),
            label: String::new(),
            balance,
            amount_currency,
            currency: currency.into(),
            taxes: Vec::new(),
            tax_origin: None,
            tax_tags: Vec::new(),
            open_line_id: None,
            installment: None,
            reconciled: false,
            manually_edited: false,
            reconcile_model: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_tax_result(&self) -> bool {
        self.tax_origin.is_some()
    }
}

/// Identifies one resolved candidate: an open line, or one installment of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateRef {
    pub open_line_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installment: Option<u32>,
}

impl std::fmt::Display for CandidateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.installment {
            Some(seq) => write!(f, "{}#{seq}", self.open_line_id),
            None => write!(f, "{}", self.open_line_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Full,
    Partial,
}

/// How one candidate was consumed by an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub candidate: CandidateRef,
    pub status: MatchStatus,
    pub currency: String,
    /// Residual in the open line's currency before the match.
    pub residual_before: Decimal,
    /// Residual valued in company currency at the movement date.
    pub residual_value: Decimal,
    /// Amount settled, in the open line's currency (same sign as the residual).
    pub paid: Decimal,
    /// Booking-rate company value of `paid`.
    pub paid_booked: Decimal,
    /// Amount settled, in company currency at the movement date.
    pub settled: Decimal,
    pub discounted: bool,
}

/// A candidate skipped without failing the whole allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateWarning {
    pub candidate: CandidateRef,
    pub message: String,
}

/// A balanced entry proposal for one bank movement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationResult {
    pub movement_id: String,
    pub lines: Vec<AllocationLine>,
    pub fully_reconciled: bool,
    pub matches: Vec<CandidateMatch>,
    pub untouched: Vec<CandidateRef>,
    pub exchange_differences: Vec<ExchangeDifferenceEntry>,
    pub warnings: Vec<CandidateWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_model: Option<String>,
}

impl AllocationResult {
    pub fn total_balance(&self) -> Decimal {
        self.lines.iter().map(|l| l.balance).sum()
    }

    pub fn line(&self, id: &str) -> Option<&AllocationLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    pub fn open_balance(&self) -> Option<&AllocationLine> {
        self.lines.iter().find(|l| l.kind == LineKind::OpenBalance)
    }

    pub fn lines_of_kind(&self, kind: LineKind) -> impl Iterator<Item = &AllocationLine> {
        self.lines.iter().filter(move |l| l.kind == kind)
    }

    pub fn match_for(&self, open_line_id: &str) -> Option<&CandidateMatch> {
        self.matches
            .iter()
            .find(|m| m.candidate.open_line_id == open_line_id)
    }
}
