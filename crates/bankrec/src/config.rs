use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;

use crate::error::BankrecError;
use crate::model::BankMovement;

// ---------------------------------------------------------------------------
// Reconciliation context
// ---------------------------------------------------------------------------

/// Company, currency and account-chart settings passed into every call.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationContext {
    pub company_currency: String,
    #[serde(default)]
    pub currencies: BTreeMap<String, CurrencyConfig>,
    /// Payment tolerance in percent of the matched residual (3 = 3%).
    #[serde(default)]
    pub payment_tolerance: Option<Decimal>,
    pub accounts: AccountChart,
    #[serde(default)]
    pub journals: BTreeMap<String, JournalConfig>,
    /// Default taxes per account code.
    #[serde(default)]
    pub account_taxes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub auto_match: AutoMatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u32,
}

fn default_decimal_places() -> u32 {
    2
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccountChart {
    #[serde(default)]
    pub suspense: Option<String>,
    pub exchange_gain: String,
    pub exchange_loss: String,
    #[serde(default)]
    pub discount_gain: Option<String>,
    #[serde(default)]
    pub discount_loss: Option<String>,
    /// Prefix for fees write-off accounts provisioned per journal.
    #[serde(default = "default_fees_prefix")]
    pub fees_prefix: String,
}

fn default_fees_prefix() -> String {
    "FEES".into()
}

/// Per-journal overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub suspense: Option<String>,
    /// Pre-provisioned fees account; otherwise one is created on first use.
    #[serde(default)]
    pub fees: Option<String>,
}

// ---------------------------------------------------------------------------
// Auto-match
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AutoMatchConfig {
    /// Reconciliation model name attributed to auto-matched lines.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_min_label_score")]
    pub min_label_score: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_model() -> String {
    "invoice_matching".into()
}

fn default_min_label_score() -> f64 {
    0.5
}

fn default_max_candidates() -> usize {
    20
}

impl Default for AutoMatchConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            min_label_score: default_min_label_score(),
            max_candidates: default_max_candidates(),
        }
    }
}

// ---------------------------------------------------------------------------
// Construct + Validate
// ---------------------------------------------------------------------------

impl ReconciliationContext {
    pub fn new(company_currency: impl Into<String>, accounts: AccountChart) -> Self {
        Self {
            company_currency: company_currency.into(),
            currencies: BTreeMap::new(),
            payment_tolerance: None,
            accounts,
            journals: BTreeMap::new(),
            account_taxes: BTreeMap::new(),
            auto_match: AutoMatchConfig::default(),
        }
    }

    pub fn from_toml(input: &str) -> Result<Self, BankrecError> {
        let ctx: ReconciliationContext =
            toml::from_str(input).map_err(|e| BankrecError::ConfigParse(e.to_string()))?;
        ctx.validate()?;
        Ok(ctx)
    }

    pub fn validate(&self) -> Result<(), BankrecError> {
        if self.company_currency.trim().is_empty() {
            return Err(BankrecError::Configuration(
                "company_currency must not be empty".into(),
            ));
        }

        if let Some(tol) = self.payment_tolerance {
            if tol.is_sign_negative() || tol >= Decimal::ONE_HUNDRED {
                return Err(BankrecError::Configuration(format!(
                    "payment_tolerance must be in [0, 100), got {tol}"
                )));
            }
        }

        for (code, cur) in &self.currencies {
            if cur.decimal_places > 9 {
                return Err(BankrecError::Configuration(format!(
                    "currency '{code}': decimal_places must be at most 9, got {}",
                    cur.decimal_places
                )));
            }
        }

        if self.accounts.exchange_gain.is_empty() || self.accounts.exchange_loss.is_empty() {
            return Err(BankrecError::Configuration(
                "exchange gain/loss accounts are required".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.auto_match.min_label_score) {
            return Err(BankrecError::Configuration(format!(
                "auto_match.min_label_score must be in [0, 1], got {}",
                self.auto_match.min_label_score
            )));
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Currency helpers
    // -----------------------------------------------------------------------

    pub fn decimal_places(&self, currency: &str) -> u32 {
        self.currencies
            .get(currency)
            .map(|c| c.decimal_places)
            .unwrap_or_else(default_decimal_places)
    }

    /// Round half away from zero to the currency's precision.
    pub fn round(&self, amount: Decimal, currency: &str) -> Decimal {
        amount.round_dp_with_strategy(
            self.decimal_places(currency),
            RoundingStrategy::MidpointAwayFromZero,
        )
    }

    pub fn is_zero(&self, amount: Decimal, currency: &str) -> bool {
        self.round(amount, currency).is_zero()
    }

    /// Smallest representable amount of the currency (0.01 for 2 decimals).
    pub fn rounding_unit(&self, currency: &str) -> Decimal {
        Decimal::new(1, self.decimal_places(currency))
    }

    pub fn round_company(&self, amount: Decimal) -> Decimal {
        self.round(amount, &self.company_currency)
    }

    // -----------------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------------

    /// Suspense account for a movement: movement override, then journal, then company.
    pub fn suspense_account<'a>(&'a self, movement: &'a BankMovement) -> Result<&'a str, BankrecError> {
        movement
            .suspense_account
            .as_deref()
            .or_else(|| {
                self.journals
                    .get(&movement.journal)
                    .and_then(|j| j.suspense.as_deref())
            })
            .or(self.accounts.suspense.as_deref())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                BankrecError::Configuration(format!(
                    "no suspense account configured for journal '{}'",
                    movement.journal
                ))
            })
    }

    pub fn default_taxes(&self, account: &str) -> &[String] {
        self.account_taxes
            .get(account)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Tolerance as a fraction (0.03 for 3%), if one is configured and non-zero.
    pub fn tolerance_fraction(&self) -> Option<Decimal> {
        self.payment_tolerance
            .filter(|t| !t.is_zero())
            .map(|t| t / Decimal::ONE_HUNDRED)
    }

    /// Discount account for a discount line of the given sign.
    /// Debit discount (we granted it) goes to loss, credit discount to gain.
    pub fn discount_account(&self, balance: Decimal) -> Result<&str, BankrecError> {
        let (account, name) = if balance.is_sign_positive() {
            (self.accounts.discount_loss.as_deref(), "discount_loss")
        } else {
            (self.accounts.discount_gain.as_deref(), "discount_gain")
        };
        account.ok_or_else(|| {
            BankrecError::Configuration(format!("accounts.{name} is required for early payment discounts"))
        })
    }

    /// Exchange gain/loss account for the counterpart of a receivable-side delta.
    pub fn exchange_account(&self, counterpart_balance: Decimal) -> &str {
        if counterpart_balance.is_sign_negative() {
            &self.accounts.exchange_gain
        } else {
            &self.accounts.exchange_loss
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
