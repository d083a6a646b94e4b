use tracing::debug;

use crate::config::ReconciliationContext;
use crate::engine::Budget;
use crate::error::BankrecError;
use crate::model::{AllocationLine, BankMovement, LineKind};

/// Where the open balance went.
#[derive(Debug, Clone, PartialEq)]
pub struct Closing {
    pub line: Option<AllocationLine>,
    /// False when the open balance sits on the suspense account.
    pub fully_reconciled: bool,
}

/// Post whatever is left of the budget.
///
/// Nothing is emitted when the remainder rounds to zero. Otherwise one line goes to
/// `manual_account` when given, else to the movement's suspense account. The
/// suspense account is resolved even when it ends up unused, so a missing
/// configuration fails before any line is produced.
pub fn close(
    ctx: &ReconciliationContext,
    remaining: &Budget,
    movement: &BankMovement,
    manual_account: Option<&str>,
    apply_default_taxes: bool,
    reconcile_model: Option<&str>,
) -> Result<Closing, BankrecError> {
    let suspense = ctx.suspense_account(movement)?;
    let company = ctx.company_currency.as_str();

    if ctx.is_zero(remaining.balance, company) {
        return Ok(Closing {
            line: None,
            fully_reconciled: true,
        });
    }

    let account = manual_account.unwrap_or(suspense);
    let mut line = AllocationLine::new(
        "open_balance",
        LineKind::OpenBalance,
        account,
        -remaining.balance,
        -remaining.amount_currency,
        movement.currency(company),
    )
    .with_label(movement.label.clone());
    line.reconcile_model = reconcile_model.map(str::to_string);
    if manual_account.is_some() && apply_default_taxes {
        line.taxes = ctx.default_taxes(account).to_vec();
    }

    debug!(movement = %movement.id, %account, balance = %line.balance, "open balance");

    Ok(Closing {
        fully_reconciled: manual_account.is_some(),
        line: Some(line),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountChart;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ctx() -> ReconciliationContext {
        let mut ctx = ReconciliationContext::new(
            "EUR",
            AccountChart {
                suspense: Some("499000".into()),
                exchange_gain: "766000".into(),
                exchange_loss: "666000".into(),
                discount_gain: None,
                discount_loss: None,
                fees_prefix: "FEES".into(),
            },
        );
        ctx.account_taxes.insert("627000".into(), vec!["VAT20".into()]);
        ctx
    }

    fn movement() -> BankMovement {
        BankMovement {
            id: "st_1".into(),
            journal: "BNK1".into(),
            date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            amount: dec!(200),
            foreign: None,
            label: "transfer".into(),
            partner: None,
            account: "512000".into(),
            suspense_account: None,
        }
    }

    fn budget(v: rust_decimal::Decimal) -> Budget {
        Budget { balance: v, amount_currency: v }
    }

    #[test]
    fn zero_remaining_emits_nothing() {
        let c = close(&ctx(), &budget(dec!(0.001)), &movement(), None, false, None).unwrap();
        assert!(c.line.is_none());
        assert!(c.fully_reconciled);
    }

    #[test]
    fn remainder_goes_to_suspense() {
        let c = close(&ctx(), &budget(dec!(50)), &movement(), None, false, Some("rule_7")).unwrap();
        let line = c.line.unwrap();
        assert_eq!(line.account, "499000");
        assert_eq!(line.balance, dec!(-50));
        assert_eq!(line.reconcile_model.as_deref(), Some("rule_7"));
        assert!(!c.fully_reconciled);
    }

    #[test]
    fn manual_account_with_default_taxes() {
        let c = close(&ctx(), &budget(dec!(-120)), &movement(), Some("627000"), true, None).unwrap();
        let line = c.line.unwrap();
        assert_eq!(line.account, "627000");
        assert_eq!(line.balance, dec!(120));
        assert_eq!(line.taxes, vec!["VAT20".to_string()]);
        assert!(c.fully_reconciled);
    }

    #[test]
    fn missing_suspense_fails_even_when_balanced() {
        let mut ctx = ctx();
        ctx.accounts.suspense = None;
        let err = close(&ctx, &budget(dec!(0)), &movement(), None, false, None).unwrap_err();
        assert!(matches!(err, BankrecError::Configuration(_)));
    }
}
