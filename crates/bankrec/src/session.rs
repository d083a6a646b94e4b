//! Reconciliation sessions: the operations exposed to callers.
//!
//! Each operation edits a copy of the movement's session, rebuilds the whole
//! proposal from scratch and only then swaps the copy in. A failing operation
//! leaves the previous proposal untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::book::{Book, Settlement};
use crate::closer;
use crate::config::ReconciliationContext;
use crate::currency::CurrencyConverter;
use crate::engine::{liquidity_line, AllocationEngine, Budget};
use crate::error::BankrecError;
use crate::matcher::{CandidateFinder, LabelMatcher};
use crate::model::{AllocationLine, AllocationResult, BankMovement, CandidateRef, LineKind, MatchStatus};
use crate::residual::ResidualResolver;
use crate::tax::{expand_line, expand_settlement, TaxEngine};
use crate::terms::{PaymentTermSchedule, StoredSchedule};

/// Changes to one proposal line. Unset fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinePatch {
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub amount_currency: Option<Decimal>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub taxes: Option<Vec<String>>,
    #[serde(default)]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// A line the user wrote or edited. Kept verbatim across rebuilds.
#[derive(Debug, Clone)]
struct ManualEntry {
    id: String,
    account: String,
    label: String,
    /// Tax-inclusive amount in company currency.
    balance: Decimal,
    amount_currency: Decimal,
    currency: String,
    taxes: Vec<String>,
    /// Set when the entry forces the settlement of a candidate.
    candidate: Option<CandidateRef>,
    reconcile_model: Option<String>,
}

impl ManualEntry {
    fn to_line(&self) -> AllocationLine {
        let kind = if self.candidate.is_some() {
            LineKind::Settlement
        } else {
            LineKind::Manual
        };
        let mut line = AllocationLine::new(
            self.id.clone(),
            kind,
            self.account.clone(),
            self.balance,
            self.amount_currency,
            self.currency.clone(),
        )
        .with_label(self.label.clone());
        line.taxes = self.taxes.clone();
        line.manually_edited = true;
        line.reconcile_model = self.reconcile_model.clone();
        if let Some(cref) = &self.candidate {
            line.open_line_id = Some(cref.open_line_id.clone());
            line.installment = cref.installment;
        }
        line
    }

    fn apply(&mut self, patch: &LinePatch, ctx: &ReconciliationContext) {
        if let Some(balance) = patch.balance {
            self.amount_currency = match patch.amount_currency {
                Some(amount) => amount,
                None if self.currency == ctx.company_currency => balance,
                None if self.balance.is_zero() => self.amount_currency,
                None => ctx.round(self.amount_currency * balance / self.balance, &self.currency),
            };
            self.balance = balance;
        } else if let Some(amount) = patch.amount_currency {
            self.amount_currency = amount;
        }
        if let Some(account) = &patch.account {
            self.account = account.clone();
        }
        if let Some(taxes) = &patch.taxes {
            self.taxes = taxes.clone();
        }
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
    }
}

#[derive(Debug, Clone)]
struct OpenBalanceTarget {
    account: String,
    default_taxes: bool,
}

#[derive(Debug, Clone)]
struct Session {
    movement: BankMovement,
    /// Selected open lines, in allocation order.
    selection: Vec<String>,
    /// Candidates the user removed from the proposal.
    excluded: BTreeSet<CandidateRef>,
    removed_taxes: BTreeMap<CandidateRef, BTreeSet<String>>,
    manual: Vec<ManualEntry>,
    open_balance: Option<OpenBalanceTarget>,
    reconcile_model: Option<String>,
    next_manual: u32,
    result: Option<AllocationResult>,
}

impl Session {
    fn new(movement: BankMovement) -> Self {
        Self {
            movement,
            selection: Vec::new(),
            excluded: BTreeSet::new(),
            removed_taxes: BTreeMap::new(),
            manual: Vec::new(),
            open_balance: None,
            reconcile_model: None,
            next_manual: 1,
            result: None,
        }
    }

    fn line(&self, line_id: &str) -> Result<AllocationLine, BankrecError> {
        self.result
            .as_ref()
            .and_then(|r| r.line(line_id))
            .cloned()
            .ok_or_else(|| BankrecError::UnknownLine(line_id.to_string()))
    }

    /// Base line plus its tax lines.
    fn gross(&self, line: &AllocationLine) -> (Decimal, Decimal) {
        let prefix = format!("{}:tax:", line.id);
        self.result
            .iter()
            .flat_map(|r| r.lines.iter())
            .filter(|l| l.id == line.id || l.id.starts_with(&prefix))
            .fold((Decimal::ZERO, Decimal::ZERO), |(b, a), l| {
                (b + l.balance, a + l.amount_currency)
            })
    }

    fn manual_mut(&mut self, id: &str) -> Option<&mut ManualEntry> {
        self.manual.iter_mut().find(|m| m.id == id)
    }

    fn next_manual_id(&mut self) -> String {
        let id = format!("manual_{}", self.next_manual);
        self.next_manual += 1;
        id
    }

    /// Turn a line into a free manual entry, detached from any candidate.
    fn detach(&mut self, line: &AllocationLine) {
        let (balance, amount_currency) = self.gross(line);
        if let Some(cref) = candidate_of(line) {
            self.excluded.insert(cref);
        }
        self.manual.retain(|m| m.id != line.id);
        let id = self.next_manual_id();
        self.manual.push(ManualEntry {
            id,
            account: line.account.clone(),
            label: line.label.clone(),
            balance,
            amount_currency,
            currency: line.currency.clone(),
            taxes: line.taxes.clone(),
            candidate: None,
            reconcile_model: line.reconcile_model.clone(),
        });
    }
}

fn candidate_of(line: &AllocationLine) -> Option<CandidateRef> {
    line.open_line_id.as_ref().map(|id| CandidateRef {
        open_line_id: id.clone(),
        installment: line.installment,
    })
}

fn not_editable(line: &AllocationLine) -> BankrecError {
    let reason = match line.kind {
        LineKind::Liquidity => "the bank line follows the statement",
        LineKind::Tax => "tax lines are recomputed from their base line",
        LineKind::WriteOff | LineKind::EarlyPaymentDiscount => "computed by the allocation",
        _ => "not editable",
    };
    BankrecError::LineNotEditable {
        line_id: line.id.clone(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    ctx: ReconciliationContext,
    converter: Box<dyn CurrencyConverter + Send + Sync>,
    taxes: Box<dyn TaxEngine + Send + Sync>,
    schedule: Box<dyn PaymentTermSchedule + Send + Sync>,
    finder: Box<dyn CandidateFinder + Send + Sync>,
    book: Arc<Book>,
    sessions: BTreeMap<String, Session>,
}

impl Reconciler {
    pub fn new(
        ctx: ReconciliationContext,
        book: Arc<Book>,
        converter: impl CurrencyConverter + Send + Sync + 'static,
        taxes: impl TaxEngine + Send + Sync + 'static,
    ) -> Self {
        let finder = LabelMatcher::new(ctx.auto_match.clone());
        Self {
            ctx,
            converter: Box::new(converter),
            taxes: Box::new(taxes),
            schedule: Box::new(StoredSchedule),
            finder: Box::new(finder),
            book,
            sessions: BTreeMap::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: impl PaymentTermSchedule + Send + Sync + 'static) -> Self {
        self.schedule = Box::new(schedule);
        self
    }

    pub fn with_finder(mut self, finder: impl CandidateFinder + Send + Sync + 'static) -> Self {
        self.finder = Box::new(finder);
        self
    }

    pub fn context(&self) -> &ReconciliationContext {
        &self.ctx
    }

    pub fn book(&self) -> &Arc<Book> {
        &self.book
    }

    /// Current proposal for a movement.
    pub fn proposal(&self, movement_id: &str) -> Option<&AllocationResult> {
        self.sessions.get(movement_id).and_then(|s| s.result.as_ref())
    }

    /// Register a movement. Its first proposal has no selection: the whole
    /// amount sits on the open balance.
    pub fn add_movement(&mut self, movement: BankMovement) -> Result<AllocationResult, BankrecError> {
        let mut session = Session::new(movement);
        let (result, _) = self.build(&session)?;
        session.result = Some(result.clone());
        self.sessions.insert(session.movement.id.clone(), session);
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Editing operations
    // -----------------------------------------------------------------------

    /// Replace the selected open lines. Manually edited lines are kept unless
    /// they settle a line that is no longer selected.
    pub fn set_lines(
        &mut self,
        movement_id: &str,
        open_line_ids: &[String],
    ) -> Result<AllocationResult, BankrecError> {
        let mut selection: Vec<String> = Vec::with_capacity(open_line_ids.len());
        for id in open_line_ids {
            if !selection.contains(id) {
                selection.push(id.clone());
            }
        }
        self.update(movement_id, move |session, _| {
            session.manual.retain(|m| {
                m.candidate
                    .as_ref()
                    .map_or(true, |c| selection.contains(&c.open_line_id))
            });
            session.selection = selection;
            session.excluded.clear();
            session.removed_taxes.clear();
            Ok(())
        })
    }

    /// Move a line to another account. The open balance keeps being
    /// recomputed; a settlement line becomes a manual line.
    pub fn set_account(
        &mut self,
        movement_id: &str,
        line_id: &str,
        account: &str,
    ) -> Result<AllocationResult, BankrecError> {
        let account = account.to_string();
        let line_id = line_id.to_string();
        self.update(movement_id, move |session, _| {
            let line = session.line(&line_id)?;
            match line.kind {
                LineKind::OpenBalance => {
                    let default_taxes = session
                        .open_balance
                        .as_ref()
                        .is_some_and(|t| t.default_taxes);
                    session.open_balance = Some(OpenBalanceTarget { account, default_taxes });
                }
                LineKind::Manual => match session.manual_mut(&line.id) {
                    Some(entry) => entry.account = account,
                    None => return Err(BankrecError::UnknownLine(line.id.clone())),
                },
                LineKind::Settlement => {
                    session.detach(&line);
                    if let Some(entry) = session.manual.last_mut() {
                        entry.account = account;
                    }
                }
                _ => return Err(not_editable(&line)),
            }
            Ok(())
        })
    }

    /// Post the open balance to `account` instead of suspense, optionally with
    /// the account's default taxes.
    pub fn set_open_balance_account(
        &mut self,
        movement_id: &str,
        account: &str,
        apply_default_taxes: bool,
    ) -> Result<AllocationResult, BankrecError> {
        let account = account.to_string();
        self.update(movement_id, move |session, _| {
            session.open_balance = Some(OpenBalanceTarget {
                account,
                default_taxes: apply_default_taxes,
            });
            Ok(())
        })
    }

    pub fn edit_line(
        &mut self,
        movement_id: &str,
        line_id: &str,
        patch: LinePatch,
    ) -> Result<AllocationResult, BankrecError> {
        let line_id = line_id.to_string();
        self.update(movement_id, move |session, ctx| {
            let line = session.line(&line_id)?;
            match line.kind {
                LineKind::Manual => match session.manual_mut(&line.id) {
                    Some(entry) => entry.apply(&patch, ctx),
                    None => return Err(BankrecError::UnknownLine(line.id.clone())),
                },
                LineKind::OpenBalance => {
                    // The edited open balance becomes a manual line; any
                    // difference goes to a fresh open balance.
                    let (balance, amount_currency) = session.gross(&line);
                    let id = session.next_manual_id();
                    let mut entry = ManualEntry {
                        id,
                        account: line.account.clone(),
                        label: line.label.clone(),
                        balance,
                        amount_currency,
                        currency: line.currency.clone(),
                        taxes: line.taxes.clone(),
                        candidate: None,
                        reconcile_model: line.reconcile_model.clone(),
                    };
                    entry.apply(&patch, ctx);
                    session.manual.push(entry);
                }
                LineKind::Settlement if patch.account.is_some() => {
                    session.detach(&line);
                    if let Some(entry) = session.manual.last_mut() {
                        entry.apply(&patch, ctx);
                    }
                }
                LineKind::Settlement => force_settlement(session, ctx, &line, &patch)?,
                _ => return Err(not_editable(&line)),
            }
            Ok(())
        })
    }

    pub fn delete_line(
        &mut self,
        movement_id: &str,
        line_id: &str,
    ) -> Result<AllocationResult, BankrecError> {
        let line_id = line_id.to_string();
        self.update(movement_id, move |session, _| {
            let line = session.line(&line_id)?;
            match line.kind {
                LineKind::OpenBalance => session.open_balance = None,
                LineKind::Manual => session.manual.retain(|m| m.id != line.id),
                LineKind::Settlement => {
                    session.manual.retain(|m| m.id != line.id);
                    if let Some(cref) = candidate_of(&line) {
                        session.excluded.insert(cref);
                    }
                }
                LineKind::Tax => remove_tax(session, &line)?,
                _ => return Err(not_editable(&line)),
            }
            Ok(())
        })
    }

    /// Select the finder's candidates. Kept only if they settle the movement
    /// with nothing left on suspense; the selection is then trimmed to the
    /// lines actually used.
    #[instrument(skip_all, fields(movement = %movement_id))]
    pub fn try_auto_reconcile(
        &mut self,
        movement_id: &str,
    ) -> Result<Option<AllocationResult>, BankrecError> {
        self.ensure_open(movement_id)?;
        let session = self.session(movement_id)?;
        let found = self
            .finder
            .find_candidates(&session.movement, &self.book.open_lines());
        if found.is_empty() {
            debug!("no candidates");
            return Ok(None);
        }

        let mut trial = session.clone();
        trial.selection = found;
        trial.excluded.clear();
        trial.removed_taxes.clear();
        trial.reconcile_model = Some(self.ctx.auto_match.model.clone());

        let (result, _) = self.build(&trial)?;
        if !result.fully_reconciled {
            debug!("candidates leave an open balance");
            return Ok(None);
        }

        let used: BTreeSet<&str> = result
            .matches
            .iter()
            .map(|m| m.candidate.open_line_id.as_str())
            .collect();
        trial.selection.retain(|id| used.contains(id.as_str()));
        let (result, _) = self.build(&trial)?;
        info!(lines = trial.selection.len(), "auto-reconciled");
        trial.result = Some(result.clone());
        self.sessions.insert(movement_id.to_string(), trial);
        Ok(Some(result))
    }

    /// Recompute against the current open lines without changing the selection.
    pub fn refresh(&mut self, movement_id: &str) -> Result<AllocationResult, BankrecError> {
        self.update(movement_id, |_, _| Ok(()))
    }

    /// Drop the selection and every manual edit.
    pub fn discard(&mut self, movement_id: &str) -> Result<AllocationResult, BankrecError> {
        self.update(movement_id, |session, _| {
            *session = Session::new(session.movement.clone());
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Rebuild against fresh open lines and commit. A concurrent change to one
    /// of the lines triggers one rebuild and retry.
    #[instrument(skip_all, fields(movement = %movement_id))]
    pub fn validate(&mut self, movement_id: &str) -> Result<Settlement, BankrecError> {
        self.ensure_open(movement_id)?;
        let session = self.session(movement_id)?.clone();

        let (result, versions) = self.build(&session)?;
        let (settlement, result) = match self.book.commit(&result, &versions) {
            Ok(settlement) => (settlement, result),
            Err(BankrecError::ConcurrentModification { open_line_id }) => {
                warn!(%open_line_id, "open line changed since the proposal was built; retrying");
                let (result, versions) = self.build(&session)?;
                (self.book.commit(&result, &versions)?, result)
            }
            Err(e) => return Err(e),
        };

        if let Some(stored) = self.sessions.get_mut(movement_id) {
            stored.result = Some(result);
        }
        Ok(settlement)
    }

    /// Undo a committed settlement and rebuild the proposal on the restored lines.
    pub fn unreconcile(&mut self, movement_id: &str) -> Result<AllocationResult, BankrecError> {
        self.session(movement_id)?;
        self.book.unreconcile(movement_id)?;
        self.refresh(movement_id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn session(&self, movement_id: &str) -> Result<&Session, BankrecError> {
        self.sessions
            .get(movement_id)
            .ok_or_else(|| BankrecError::UnknownMovement(movement_id.to_string()))
    }

    fn ensure_open(&self, movement_id: &str) -> Result<(), BankrecError> {
        if self.book.is_reconciled(movement_id) {
            return Err(BankrecError::AlreadyReconciled(movement_id.to_string()));
        }
        Ok(())
    }

    fn update<F>(&mut self, movement_id: &str, edit: F) -> Result<AllocationResult, BankrecError>
    where
        F: FnOnce(&mut Session, &ReconciliationContext) -> Result<(), BankrecError>,
    {
        self.ensure_open(movement_id)?;
        let mut session = self.session(movement_id)?.clone();
        edit(&mut session, &self.ctx)?;
        let (result, _) = self.build(&session)?;
        session.result = Some(result.clone());
        self.sessions.insert(movement_id.to_string(), session);
        Ok(result)
    }

    /// Resolve, allocate, expand taxes, close. Returns the proposal and the
    /// versions of the open lines it was built from.
    fn build(
        &self,
        session: &Session,
    ) -> Result<(AllocationResult, BTreeMap<String, u64>), BankrecError> {
        let ctx = &self.ctx;
        ctx.validate()?;
        let movement = &session.movement;
        ctx.suspense_account(movement)?;
        let company = ctx.company_currency.as_str();
        let mv_currency = movement.currency(company).to_string();

        let snapshot = self.book.snapshot(&session.selection)?;
        let versions = snapshot
            .iter()
            .map(|l| (l.id.clone(), l.version))
            .collect();

        let resolver = ResidualResolver::new(ctx, self.schedule.as_ref());
        let mut candidates = resolver.candidates_for(&snapshot, Some(movement.date));
        for cand in &mut candidates {
            if let Some(removed) = session.removed_taxes.get(&cand.reference()) {
                cand.taxes.retain(|t| !removed.contains(t));
            }
        }

        let engine = AllocationEngine::new(ctx, self.converter.as_ref(), self.taxes.as_ref());
        let mut lines = vec![liquidity_line(ctx, movement)];
        let mut budget = Budget::of(movement);
        let mut matches = Vec::new();
        let mut exchange = Vec::new();
        let mut forced = BTreeSet::new();

        for entry in &session.manual {
            let mut line = entry.to_line();
            if let Some(cref) = &entry.candidate {
                let cand = candidates
                    .iter()
                    .find(|c| &c.reference() == cref)
                    .ok_or_else(|| BankrecError::UnknownOpenLine(cref.to_string()))?;
                let (record, exch) =
                    engine.forced_match(movement, cand, -line.balance, -line.amount_currency)?;
                line.reconciled = record.status == MatchStatus::Full;
                matches.push(record);
                exchange.extend(exch);
                forced.insert(cref.clone());
            }
            budget.balance += line.balance;
            budget.amount_currency += self.movement_share(movement, &mv_currency, &line);
            if entry.candidate.is_some() {
                lines.extend(expand_settlement(ctx, self.taxes.as_ref(), line)?);
            } else {
                lines.extend(expand_line(ctx, self.taxes.as_ref(), line)?);
            }
        }

        candidates.retain(|c| {
            let r = c.reference();
            !session.excluded.contains(&r) && !forced.contains(&r)
        });

        let mut allocation = engine.allocate(movement, budget, &candidates, self.book.as_ref())?;
        for line in &mut allocation.lines {
            line.reconcile_model = session.reconcile_model.clone();
        }
        lines.append(&mut allocation.lines);
        matches.append(&mut allocation.matches);
        exchange.append(&mut allocation.exchange_differences);

        let (manual_account, default_taxes) = match &session.open_balance {
            Some(t) => (Some(t.account.as_str()), t.default_taxes),
            None => (None, false),
        };
        let closing = closer::close(
            ctx,
            &allocation.remaining,
            movement,
            manual_account,
            default_taxes,
            session.reconcile_model.as_deref(),
        )?;
        if let Some(line) = closing.line {
            lines.extend(expand_line(ctx, self.taxes.as_ref(), line)?);
        }

        let total: Decimal = lines.iter().map(|l| l.balance).sum();
        if !ctx.is_zero(total, company) {
            return Err(BankrecError::Unbalanced {
                movement_id: movement.id.clone(),
                difference: total,
            });
        }

        let result = AllocationResult {
            movement_id: movement.id.clone(),
            lines,
            fully_reconciled: closing.fully_reconciled,
            matches,
            untouched: allocation.untouched,
            exchange_differences: exchange,
            warnings: allocation.warnings,
            reconcile_model: session.reconcile_model.clone(),
        };
        Ok((result, versions))
    }

    /// Part of the movement's own-currency amount consumed by a manual line.
    fn movement_share(&self, movement: &BankMovement, mv_currency: &str, line: &AllocationLine) -> Decimal {
        if line.currency == mv_currency {
            line.amount_currency
        } else if mv_currency == self.ctx.company_currency {
            line.balance
        } else {
            match movement.implied_rate() {
                Some(rate) if !rate.is_zero() => self.ctx.round(line.balance / rate, mv_currency),
                _ => Decimal::ZERO,
            }
        }
    }
}

/// Force the amount settled on a candidate. Amounts beyond the residual are
/// capped within tolerance and rejected past it.
fn force_settlement(
    session: &mut Session,
    ctx: &ReconciliationContext,
    line: &AllocationLine,
    patch: &LinePatch,
) -> Result<(), BankrecError> {
    let cref = candidate_of(line).ok_or_else(|| BankrecError::UnknownLine(line.id.clone()))?;
    let record = session
        .result
        .as_ref()
        .and_then(|r| r.matches.iter().find(|m| m.candidate == cref))
        .cloned()
        .ok_or_else(|| BankrecError::UnknownOpenLine(cref.to_string()))?;

    let (gross_balance, _) = session.gross(line);
    let requested = -patch.balance.unwrap_or(gross_balance);
    if requested.is_zero() {
        session.manual.retain(|m| m.id != line.id);
        session.excluded.insert(cref);
        return Ok(());
    }

    let limit = record.residual_value;
    let tolerance = ctx.tolerance_fraction().unwrap_or_default();
    let over = requested.is_sign_negative() != limit.is_sign_negative()
        || requested.abs() > limit.abs() * (Decimal::ONE + tolerance);
    if over {
        return Err(BankrecError::OverAllocation {
            open_line_id: cref.open_line_id.clone(),
            requested,
            residual: limit,
        });
    }
    let settled = if requested.abs() > limit.abs() { limit } else { requested };

    let paid_own = if settled.abs() == limit.abs() {
        record.residual_before
    } else if let Some(amount) = patch.amount_currency {
        -amount
    } else if record.currency == ctx.company_currency {
        settled
    } else {
        ctx.round(record.residual_before * settled / limit, &record.currency)
    };

    let taxes = patch.taxes.clone().unwrap_or_else(|| line.taxes.clone());
    let label = patch.label.clone().unwrap_or_else(|| line.label.clone());
    match session.manual_mut(&line.id) {
        Some(entry) => {
            entry.balance = -settled;
            entry.amount_currency = -paid_own;
            entry.taxes = taxes;
            entry.label = label;
        }
        None => session.manual.push(ManualEntry {
            id: line.id.clone(),
            account: line.account.clone(),
            label,
            balance: -settled,
            amount_currency: -paid_own,
            currency: line.currency.clone(),
            taxes,
            candidate: Some(cref),
            reconcile_model: line.reconcile_model.clone(),
        }),
    }
    Ok(())
}

/// Removing a tax line removes the tax from its base line.
fn remove_tax(session: &mut Session, line: &AllocationLine) -> Result<(), BankrecError> {
    let (parent_id, _) = line
        .id
        .rsplit_once(":tax:")
        .ok_or_else(|| BankrecError::UnknownLine(line.id.clone()))?;
    let tax = line
        .tax_origin
        .clone()
        .ok_or_else(|| BankrecError::UnknownLine(line.id.clone()))?;

    if let Some(entry) = session.manual_mut(parent_id) {
        entry.taxes.retain(|t| *t != tax);
        return Ok(());
    }
    let parent = session.line(parent_id)?;
    match parent.kind {
        LineKind::Settlement => {
            if let Some(cref) = candidate_of(&parent) {
                session.removed_taxes.entry(cref).or_default().insert(tax);
            }
        }
        LineKind::OpenBalance => {
            if let Some(target) = session.open_balance.as_mut() {
                target.default_taxes = false;
            }
        }
        _ => return Err(not_editable(line)),
    }
    Ok(())
}
