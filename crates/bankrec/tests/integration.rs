use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use visigrid_bankrec::config::AccountChart;
use visigrid_bankrec::engine::FeesAccountProvider;
use visigrid_bankrec::model::{
    CandidateRef, EarlyPaymentDiscount, ForeignAmount, Installment, MatchStatus,
};
use visigrid_bankrec::scenario::{load_open_lines_csv, Scenario};
use visigrid_bankrec::tax::TaxRule;
use visigrid_bankrec::{
    AllocationResult, BankMovement, BankrecError, Book, CurrencyConverter, ExchangeState, LineKind,
    LinePatch, MovementStatus, OpenLine, RateTable, Reconciler, ReconciliationContext, TaxTable,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn ctx(tolerance: Option<Decimal>) -> ReconciliationContext {
    let mut ctx = ReconciliationContext::new(
        "EUR",
        AccountChart {
            suspense: Some("499000".into()),
            exchange_gain: "766000".into(),
            exchange_loss: "666000".into(),
            discount_gain: Some("765000".into()),
            discount_loss: Some("665000".into()),
            fees_prefix: "FEES".into(),
        },
    );
    ctx.payment_tolerance = tolerance;
    ctx
}

fn invoice(id: &str, residual: Decimal) -> OpenLine {
    OpenLine {
        id: id.into(),
        document: id.into(),
        account: "411000".into(),
        partner: None,
        date: d("2026-01-05"),
        reference: String::new(),
        currency: "EUR".into(),
        residual,
        residual_balance: None,
        installments: Vec::new(),
        discount: None,
        taxes: Vec::new(),
        taxes_from_account: false,
        version: 0,
    }
}

fn usd_invoice(id: &str, residual: Decimal, booked: Decimal) -> OpenLine {
    OpenLine {
        currency: "USD".into(),
        residual_balance: Some(booked),
        ..invoice(id, residual)
    }
}

fn movement(id: &str, amount: Decimal) -> BankMovement {
    BankMovement {
        id: id.into(),
        journal: "BNK1".into(),
        date: d("2026-01-20"),
        amount,
        foreign: None,
        label: String::new(),
        partner: None,
        account: "512000".into(),
        suspense_account: None,
    }
}

fn taxes() -> TaxTable {
    TaxTable::default().with_tax(
        "VAT20",
        TaxRule {
            rate: dec!(20),
            account: Some("445700".into()),
            tag: None,
            transition_account: Some("445710".into()),
        },
    )
}

fn setup(ctx: ReconciliationContext, lines: Vec<OpenLine>) -> (Arc<Book>, Reconciler) {
    let book = Arc::new(Book::with_lines(&ctx, lines));
    let rates = RateTable::new("EUR").with_rate("USD", d("2026-01-01"), dec!(1.25)).unwrap();
    let reconciler = Reconciler::new(ctx, Arc::clone(&book), rates, taxes());
    (book, reconciler)
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn balance(result: &AllocationResult, line_id: &str) -> Decimal {
    result
        .line(line_id)
        .unwrap_or_else(|| panic!("no line {line_id}"))
        .balance
}

// -------------------------------------------------------------------------
// Balance and determinism
// -------------------------------------------------------------------------

#[test]
fn every_proposal_balances() {
    let (_, mut rec) = setup(
        ctx(Some(dec!(3))),
        vec![invoice("A", dec!(100)), invoice("B", dec!(-30)), invoice("C", dec!(75.55))],
    );
    rec.add_movement(movement("st_1", dec!(123.45))).unwrap();

    let selections: [&[&str]; 5] = [&["A"], &["A", "B"], &["C", "A", "B"], &["B"], &[]];
    for selection in selections {
        let r = rec.set_lines("st_1", &ids(selection)).unwrap();
        assert_eq!(r.total_balance(), dec!(0), "selection {selection:?}");
    }
}

#[test]
fn same_input_same_proposal() {
    let lines = vec![invoice("A", dec!(100)), invoice("B", dec!(50))];
    let (_, mut first) = setup(ctx(None), lines.clone());
    let (_, mut second) = setup(ctx(None), lines);

    first.add_movement(movement("st_1", dec!(120))).unwrap();
    second.add_movement(movement("st_1", dec!(120))).unwrap();
    let a = first.set_lines("st_1", &ids(&["A", "B"])).unwrap();
    let b = second.set_lines("st_1", &ids(&["A", "B"])).unwrap();
    assert_eq!(a, b);

    // Recomputing without changes is a no-op.
    assert_eq!(first.refresh("st_1").unwrap(), a);
}

#[test]
fn allocation_follows_selection_order() {
    let (_, mut rec) = setup(ctx(None), vec![invoice("A", dec!(100)), invoice("B", dec!(50))]);
    rec.add_movement(movement("st_1", dec!(120))).unwrap();

    let r = rec.set_lines("st_1", &ids(&["A", "B"])).unwrap();
    assert_eq!(balance(&r, "settle:A"), dec!(-100));
    assert_eq!(balance(&r, "settle:B"), dec!(-20));
    assert_eq!(r.match_for("A").unwrap().status, MatchStatus::Full);
    assert_eq!(r.match_for("B").unwrap().status, MatchStatus::Partial);

    let r = rec.set_lines("st_1", &ids(&["B", "A"])).unwrap();
    assert_eq!(balance(&r, "settle:B"), dec!(-50));
    assert_eq!(balance(&r, "settle:A"), dec!(-70));
    assert_eq!(r.match_for("A").unwrap().status, MatchStatus::Partial);
}

#[test]
fn exhausted_budget_leaves_rest_untouched() {
    let (_, mut rec) = setup(
        ctx(None),
        vec![invoice("A", dec!(100)), invoice("B", dec!(50)), invoice("C", dec!(10))],
    );
    rec.add_movement(movement("st_1", dec!(100))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["A", "B", "C"])).unwrap();
    assert_eq!(r.matches.len(), 1);
    assert_eq!(r.untouched.len(), 2);
    assert!(r.line("settle:B").is_none());
    assert!(r.fully_reconciled);
}

// -------------------------------------------------------------------------
// Over / under payment
// -------------------------------------------------------------------------

#[test]
fn payment_below_invoice_settles_partially() {
    let (book, mut rec) = setup(ctx(None), vec![invoice("INV", dec!(250))]);
    rec.add_movement(movement("st_1", dec!(200))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();
    assert_eq!(balance(&r, "settle:INV"), dec!(-200));
    assert!(!r.line("settle:INV").unwrap().reconciled);
    assert!(r.open_balance().is_none());

    rec.validate("st_1").unwrap();
    assert_eq!(book.open_line("INV").unwrap().residual, dec!(50));
}

#[test]
fn payment_above_invoice_goes_to_suspense() {
    let (book, mut rec) = setup(ctx(None), vec![invoice("INV", dec!(150))]);
    rec.add_movement(movement("st_1", dec!(200))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();
    assert_eq!(balance(&r, "settle:INV"), dec!(-150));
    let open = r.open_balance().unwrap();
    assert_eq!(open.balance, dec!(-50));
    assert_eq!(open.account, "499000");
    assert!(!r.fully_reconciled);

    rec.validate("st_1").unwrap();
    assert_eq!(book.open_line("INV").unwrap().residual, dec!(0));
}

#[test]
fn tolerance_writes_off_shortfall_to_fees_account() {
    let (book, mut rec) = setup(ctx(Some(dec!(3))), vec![invoice("INV", dec!(500))]);
    rec.add_movement(movement("st_1", dec!(490))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();

    assert_eq!(balance(&r, "settle:INV"), dec!(-500));
    let write_off = r.line("writeoff:fees").unwrap();
    assert_eq!(write_off.balance, dec!(10));
    assert_eq!(write_off.account, "FEES-BNK1");
    assert!(r.fully_reconciled);

    rec.validate("st_1").unwrap();
    assert_eq!(book.open_line("INV").unwrap().residual, dec!(0));
    // Provisioned once, then reused.
    assert_eq!(book.fees_account("BNK1"), "FEES-BNK1");
}

#[test]
fn shortfall_beyond_tolerance_stays_partial() {
    let (_, mut rec) = setup(ctx(Some(dec!(3))), vec![invoice("INV", dec!(500))]);
    rec.add_movement(movement("st_1", dec!(480))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();
    assert_eq!(balance(&r, "settle:INV"), dec!(-480));
    assert!(r.line("writeoff:fees").is_none());
    assert_eq!(r.match_for("INV").unwrap().status, MatchStatus::Partial);
}

#[test]
fn credit_note_enlarges_budget() {
    let (_, mut rec) = setup(ctx(None), vec![invoice("CN", dec!(-30)), invoice("INV", dec!(100))]);
    rec.add_movement(movement("st_1", dec!(70))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["CN", "INV"])).unwrap();
    assert_eq!(balance(&r, "settle:CN"), dec!(30));
    assert_eq!(balance(&r, "settle:INV"), dec!(-100));
    assert!(r.fully_reconciled);
}

#[test]
fn early_payment_discount_closes_invoice() {
    let mut inv = invoice("INV", dec!(100));
    inv.discount = Some(EarlyPaymentDiscount { percent: dec!(2), deadline: d("2026-01-31") });
    let (book, mut rec) = setup(ctx(None), vec![inv]);
    rec.add_movement(movement("st_1", dec!(98))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();

    assert_eq!(balance(&r, "settle:INV"), dec!(-100));
    let discount = r.line("discount:INV").unwrap();
    assert_eq!(discount.kind, LineKind::EarlyPaymentDiscount);
    assert_eq!(discount.balance, dec!(2));
    assert_eq!(discount.account, "665000");
    assert!(r.match_for("INV").unwrap().discounted);

    rec.validate("st_1").unwrap();
    assert_eq!(book.open_line("INV").unwrap().residual, dec!(0));
}

#[test]
fn installments_settle_oldest_first() {
    let mut inv = invoice("INV", dec!(300));
    inv.installments = vec![
        Installment { due_date: d("2026-02-10"), amount: dec!(200) },
        Installment { due_date: d("2026-01-10"), amount: dec!(100) },
    ];
    let (book, mut rec) = setup(ctx(None), vec![inv]);
    rec.add_movement(movement("st_1", dec!(100))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["INV"])).unwrap();
    assert_eq!(balance(&r, "settle:INV#1"), dec!(-100));
    assert_eq!(
        r.untouched,
        vec![CandidateRef { open_line_id: "INV".into(), installment: Some(2) }]
    );
    rec.validate("st_1").unwrap();
    assert_eq!(book.open_line("INV").unwrap().residual, dec!(200));

    rec.add_movement(movement("st_2", dec!(200))).unwrap();
    let r = rec.set_lines("st_2", &ids(&["INV"])).unwrap();
    assert_eq!(balance(&r, "settle:INV#2"), dec!(-200));
    assert!(r.fully_reconciled);
}

#[test]
fn partial_payment_splits_taxes_proportionally() {
    let mut bill = invoice("BILL", dec!(-120));
    bill.taxes = ids(&["VAT20"]);
    let (book, mut rec) = setup(ctx(None), vec![bill]);
    rec.add_movement(movement("st_1", dec!(-60))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["BILL"])).unwrap();
    assert_eq!(balance(&r, "settle:BILL"), dec!(60));
    assert_eq!(balance(&r, "settle:BILL:tax:VAT20"), dec!(10));
    assert_eq!(balance(&r, "settle:BILL:tax:VAT20:transition"), dec!(-10));
    assert_eq!(r.total_balance(), dec!(0));

    // What the bill's account receives is what its residual loses.
    let on_account: Decimal = r
        .lines
        .iter()
        .filter(|l| l.account == "411000")
        .map(|l| l.balance)
        .sum();
    assert_eq!(on_account, -r.matches[0].paid_booked);
    rec.validate("st_1").unwrap();
    let bill = book.open_line("BILL").unwrap();
    assert_eq!(bill.residual, dec!(-120) + on_account);
    assert_eq!(bill.residual, dec!(-60));
}

// -------------------------------------------------------------------------
// Foreign currency
// -------------------------------------------------------------------------

fn usd_movement(id: &str, eur: Decimal, usd: Decimal) -> BankMovement {
    BankMovement {
        foreign: Some(ForeignAmount { amount: usd, currency: "USD".into() }),
        ..movement(id, eur)
    }
}

#[test]
fn exchange_difference_drafted_and_discarded_on_undo() {
    let (book, mut rec) = setup(ctx(None), vec![usd_invoice("USD1", dec!(1000), dec!(1000))]);
    rec.add_movement(usd_movement("st_1", dec!(800), dec!(1000))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["USD1"])).unwrap();

    let settle = r.line("settle:USD1").unwrap();
    assert_eq!(settle.balance, dec!(-800));
    assert_eq!(settle.amount_currency, dec!(-1000));
    assert!(r.fully_reconciled);

    let entry = &r.exchange_differences[0];
    assert_eq!(entry.amount, dec!(-200));
    assert_eq!(entry.date, d("2026-01-31"));
    assert!(entry.lines.iter().any(|l| l.account == "666000" && l.balance == dec!(200)));

    rec.validate("st_1").unwrap();
    let stored = book.exchange_entry("exch:st_1:USD1").unwrap();
    assert_eq!(stored.state, ExchangeState::Draft);
    let line = book.open_line("USD1").unwrap();
    assert_eq!(line.residual, dec!(0));
    assert_eq!(line.residual_balance, Some(dec!(0)));

    rec.unreconcile("st_1").unwrap();
    let line = book.open_line("USD1").unwrap();
    assert_eq!(line.residual, dec!(1000));
    assert_eq!(line.residual_balance, Some(dec!(1000)));
    assert_eq!(
        book.exchange_entry("exch:st_1:USD1").unwrap().state,
        ExchangeState::Discarded
    );
}

#[test]
fn posted_exchange_entry_is_reversed_on_undo() {
    let (book, mut rec) = setup(ctx(None), vec![usd_invoice("USD1", dec!(1000), dec!(1000))]);
    rec.add_movement(usd_movement("st_1", dec!(800), dec!(1000))).unwrap();
    rec.set_lines("st_1", &ids(&["USD1"])).unwrap();
    rec.validate("st_1").unwrap();

    assert_eq!(book.post_document("USD1").unwrap(), ids(&["exch:st_1:USD1"]));
    rec.unreconcile("st_1").unwrap();

    let original = book.exchange_entry("exch:st_1:USD1").unwrap();
    assert_eq!(original.state, ExchangeState::Posted);
    let reversal = book.exchange_entry("exch:st_1:USD1:reversal").unwrap();
    assert_eq!(reversal.state, ExchangeState::Posted);
    assert_eq!(reversal.amount, dec!(200));
    assert_eq!(reversal.reverses.as_deref(), Some("exch:st_1:USD1"));
}

#[test]
fn reconciling_again_after_posted_undo_keeps_ledger_history() {
    let (book, mut rec) = setup(ctx(None), vec![usd_invoice("USD1", dec!(1000), dec!(1000))]);
    rec.add_movement(usd_movement("st_1", dec!(800), dec!(1000))).unwrap();
    rec.set_lines("st_1", &ids(&["USD1"])).unwrap();
    rec.validate("st_1").unwrap();
    book.post_document("USD1").unwrap();
    rec.unreconcile("st_1").unwrap();

    let settlement = rec.validate("st_1").unwrap();
    assert_eq!(
        settlement.partials[0].exchange_entry.as_deref(),
        Some("exch:st_1:USD1@2")
    );

    let entries = book.exchange_entries();
    assert_eq!(entries.len(), 3);
    let posted: Decimal = entries
        .iter()
        .filter(|e| e.state == ExchangeState::Posted)
        .map(|e| e.amount)
        .sum();
    assert_eq!(posted, dec!(-200));
    let original = book.exchange_entry("exch:st_1:USD1").unwrap();
    assert_eq!(original.amount, dec!(-200));
    assert_eq!(original.state, ExchangeState::Posted);
    assert_eq!(
        book.exchange_entry("exch:st_1:USD1:reversal").unwrap().reverses.as_deref(),
        Some("exch:st_1:USD1")
    );
}

#[test]
fn reverting_document_undoes_its_reconciliations() {
    let (book, mut rec) = setup(ctx(None), vec![invoice("A", dec!(100)), invoice("B", dec!(50))]);
    rec.add_movement(movement("st_1", dec!(150))).unwrap();
    rec.set_lines("st_1", &ids(&["A", "B"])).unwrap();
    rec.validate("st_1").unwrap();

    let undone = book.revert_document("B").unwrap();
    assert_eq!(undone, ids(&["partial:st_1:B"]));
    assert_eq!(book.open_line("B").unwrap().residual, dec!(50));
    assert_eq!(book.open_line("A").unwrap().residual, dec!(0));

    let settlement = book.settlement("st_1").unwrap();
    assert_eq!(settlement.partials.len(), 1);
    assert!(settlement
        .lines
        .iter()
        .filter(|l| l.open_line_id.as_deref() == Some("B"))
        .all(|l| !l.reconciled));
}

#[test]
fn unconvertible_candidate_is_skipped_with_warning() {
    let mut gbp = invoice("GBP1", dec!(100));
    gbp.currency = "GBP".into();
    gbp.residual_balance = Some(dec!(115));
    let (_, mut rec) = setup(ctx(None), vec![gbp, invoice("A", dec!(40))]);
    rec.add_movement(movement("st_1", dec!(40))).unwrap();
    let r = rec.set_lines("st_1", &ids(&["GBP1", "A"])).unwrap();
    assert_eq!(r.warnings.len(), 1);
    assert_eq!(r.warnings[0].candidate.open_line_id, "GBP1");
    assert_eq!(balance(&r, "settle:A"), dec!(-40));
    assert!(r.fully_reconciled);
}

// -------------------------------------------------------------------------
// Editing
// -------------------------------------------------------------------------

#[test]
fn edits_keep_proposal_balanced() {
    let (_, mut rec) = setup(ctx(None), vec![invoice("A", dec!(100)), invoice("B", dec!(80))]);
    rec.add_movement(movement("st_1", dec!(150))).unwrap();
    rec.set_lines("st_1", &ids(&["A", "B"])).unwrap();

    let r = rec
        .edit_line("st_1", "settle:A", LinePatch { balance: Some(dec!(-60)), ..Default::default() })
        .unwrap();
    assert_eq!(balance(&r, "settle:A"), dec!(-60));
    assert_eq!(balance(&r, "settle:B"), dec!(-80));
    assert_eq!(balance(&r, "open_balance"), dec!(-10));
    assert_eq!(r.total_balance(), dec!(0));

    let r = rec.delete_line("st_1", "settle:B").unwrap();
    assert_eq!(balance(&r, "open_balance"), dec!(-90));
    assert_eq!(r.total_balance(), dec!(0));

    let r = rec.set_account("st_1", "open_balance", "758000").unwrap();
    assert_eq!(r.open_balance().unwrap().account, "758000");
    assert!(r.fully_reconciled);

    let r = rec.discard("st_1").unwrap();
    assert!(r.matches.is_empty());
    assert_eq!(r.open_balance().unwrap().account, "499000");
}

#[test]
fn over_allocation_is_rejected() {
    let (_, mut rec) = setup(ctx(Some(dec!(3))), vec![invoice("A", dec!(100))]);
    rec.add_movement(movement("st_1", dec!(300))).unwrap();
    rec.set_lines("st_1", &ids(&["A"])).unwrap();
    let before = rec.proposal("st_1").unwrap().clone();

    let err = rec
        .edit_line("st_1", "settle:A", LinePatch { balance: Some(dec!(-250)), ..Default::default() })
        .unwrap_err();
    assert!(matches!(err, BankrecError::OverAllocation { ref open_line_id, .. } if open_line_id == "A"));
    assert_eq!(rec.proposal("st_1").unwrap(), &before);

    // Wrong direction is an over-allocation too.
    let err = rec
        .edit_line("st_1", "settle:A", LinePatch { balance: Some(dec!(20)), ..Default::default() })
        .unwrap_err();
    assert!(matches!(err, BankrecError::OverAllocation { .. }));
}

#[test]
fn validated_movement_is_locked() {
    let (_, mut rec) = setup(ctx(None), vec![invoice("A", dec!(100))]);
    rec.add_movement(movement("st_1", dec!(100))).unwrap();
    rec.set_lines("st_1", &ids(&["A"])).unwrap();
    rec.validate("st_1").unwrap();

    assert!(matches!(rec.validate("st_1"), Err(BankrecError::AlreadyReconciled(_))));
    assert!(matches!(
        rec.delete_line("st_1", "settle:A"),
        Err(BankrecError::AlreadyReconciled(_))
    ));
}

#[test]
fn missing_suspense_account_fails_before_any_line() {
    let mut ctx = ctx(None);
    ctx.accounts.suspense = None;
    let (_, mut rec) = setup(ctx, vec![invoice("A", dec!(100))]);
    let err = rec.add_movement(movement("st_1", dec!(100))).unwrap_err();
    assert!(matches!(err, BankrecError::Configuration(_)));
    assert!(rec.proposal("st_1").is_none());
}

// -------------------------------------------------------------------------
// Concurrency
// -------------------------------------------------------------------------

#[test]
fn concurrent_validation_never_over_consumes() {
    let ctx = ctx(None);
    let book = Arc::new(Book::with_lines(&ctx, vec![invoice("A", dec!(100))]));

    let handles: Vec<_> = (1..=2)
        .map(|n| {
            let book = Arc::clone(&book);
            let ctx = ctx.clone();
            thread::spawn(move || {
                let mut rec = Reconciler::new(ctx, book, RateTable::new("EUR"), TaxTable::default());
                let id = format!("st_{n}");
                rec.add_movement(movement(&id, dec!(60))).unwrap();
                rec.set_lines(&id, &ids(&["A"])).unwrap();
                rec.validate(&id).unwrap()
            })
        })
        .collect();

    let settlements: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let paid: Decimal = settlements
        .iter()
        .flat_map(|s| s.partials.iter())
        .map(|p| p.amount)
        .sum();
    assert_eq!(paid, dec!(100));
    assert_eq!(book.open_line("A").unwrap().residual, dec!(0));
}

/// Rate source that replaces an open line in the book on every lookup, so each
/// proposal build races a concurrent edit.
struct LineTouchingRates {
    book: Arc<Book>,
    line: String,
    rates: RateTable,
    calls: Arc<AtomicUsize>,
}

impl CurrencyConverter for LineTouchingRates {
    fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Decimal, BankrecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(line) = self.book.open_line(&self.line) {
            self.book.insert(line);
        }
        self.rates.convert(amount, from, to, date)
    }
}

#[test]
fn conflict_is_retried_once_then_surfaced() {
    let ctx = ctx(None);
    let book = Arc::new(Book::with_lines(&ctx, vec![usd_invoice("USD1", dec!(1000), dec!(1000))]));
    let calls = Arc::new(AtomicUsize::new(0));
    let rates = LineTouchingRates {
        book: Arc::clone(&book),
        line: "USD1".into(),
        rates: RateTable::new("EUR").with_rate("USD", d("2026-01-01"), dec!(1.25)).unwrap(),
        calls: Arc::clone(&calls),
    };
    let mut rec = Reconciler::new(ctx, Arc::clone(&book), rates, taxes());
    rec.add_movement(movement("st_1", dec!(800))).unwrap();
    rec.set_lines("st_1", &ids(&["USD1"])).unwrap();

    let before = calls.load(Ordering::SeqCst);
    rec.refresh("st_1").unwrap();
    let per_build = calls.load(Ordering::SeqCst) - before;
    assert!(per_build > 0);

    let before = calls.load(Ordering::SeqCst);
    let err = rec.validate("st_1").unwrap_err();
    assert!(matches!(
        err,
        BankrecError::ConcurrentModification { ref open_line_id } if open_line_id == "USD1"
    ));
    // One build, one rebuild, no third attempt.
    assert_eq!(calls.load(Ordering::SeqCst) - before, 2 * per_build);

    assert!(!book.is_reconciled("st_1"));
    let line = book.open_line("USD1").unwrap();
    assert_eq!(line.residual, dec!(1000));
    assert_eq!(line.residual_balance, Some(dec!(1000)));
    assert!(book.exchange_entries().is_empty());
}

// -------------------------------------------------------------------------
// Scenario files
// -------------------------------------------------------------------------

#[test]
fn fixture_scenario_runs() {
    let scenario = Scenario::load(&fixtures_dir().join("january.scenario.toml")).unwrap();
    assert_eq!(scenario.open_lines.len(), 4);

    let run = visigrid_bankrec::run(&scenario, true).unwrap();
    assert_eq!(run.summary.movements, 4);
    assert_eq!(run.summary.reconciled, 4);
    assert_eq!(run.summary.errors, 0);
    assert_eq!(run.summary.exchange_differences, 1);
    assert_eq!(run.summary.lines_by_kind["write_off"], 1);
    assert_eq!(run.summary.lines_by_kind["tax"], 1);

    // The USD invoice's document is posted, so its exchange entry is too.
    assert_eq!(run.exchange_entries.len(), 1);
    assert_eq!(run.exchange_entries[0].state, ExchangeState::Posted);

    let st2 = run.outcomes[1].result.as_ref().unwrap();
    assert_eq!(st2.reconcile_model.as_deref(), Some("invoice_matching"));
    assert_eq!(st2.line("writeoff:fees").unwrap().account, "FEES-BNK1");

    let st4 = run.outcomes[3].result.as_ref().unwrap();
    assert_eq!(st4.line("open_balance").unwrap().balance, dec!(30));
    assert_eq!(st4.line("open_balance:tax:VAT20").unwrap().balance, dec!(6));
}

#[test]
fn scenario_from_temp_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lines.csv"),
        "id,account,date,currency,residual,reference\nA,411000,2026-03-01,EUR,42.00,INV/42\n",
    )
    .unwrap();
    let scenario_path = dir.path().join("march.toml");
    std::fs::write(
        &scenario_path,
        r#"
name = "march"
open_lines_file = "lines.csv"

[context]
company_currency = "EUR"

[context.accounts]
suspense = "499000"
exchange_gain = "766000"
exchange_loss = "666000"

[[movements]]
id = "st_1"
journal = "BNK1"
date = "2026-03-04"
amount = "42"
label = "INV 42"
account = "512000"

[[movements]]
id = "st_2"
journal = "BNK1"
date = "2026-03-05"
amount = "-9.99"
label = "subscription"
account = "512000"
"#,
    )
    .unwrap();

    let scenario = Scenario::load(&scenario_path).unwrap();
    let run = visigrid_bankrec::run(&scenario, false).unwrap();
    assert_eq!(run.outcomes[0].status, MovementStatus::Reconciled);
    assert_eq!(run.outcomes[1].status, MovementStatus::Unmatched);
    assert_eq!(run.summary.committed, 0);
}

#[test]
fn missing_csv_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.toml");
    std::fs::write(
        &path,
        r#"
open_lines_file = "absent.csv"
[context]
company_currency = "EUR"
[context.accounts]
exchange_gain = "766000"
exchange_loss = "666000"
"#,
    )
    .unwrap();
    let err = Scenario::load(&path).unwrap_err();
    assert!(matches!(err, BankrecError::Io(_)));
}

#[test]
fn csv_fixture_loads() {
    let data = std::fs::read_to_string(fixtures_dir().join("open-lines.csv")).unwrap();
    let lines = load_open_lines_csv("open-lines.csv", &data).unwrap();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3].currency, "USD");
    assert_eq!(lines[3].document, "INV/2026/0900");
    assert_eq!(lines[0].partner.as_deref(), Some("ACME"));
}
