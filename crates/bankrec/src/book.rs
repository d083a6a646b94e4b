//! Shared store of open lines, committed settlements and exchange entries.
//!
//! Every mutation happens under one lock. Writers pass the versions of the
//! open lines they read; a stale version aborts the whole commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReconciliationContext;
use crate::engine::FeesAccountProvider;
use crate::error::BankrecError;
use crate::exchange::{ExchangeDifferenceEntry, ExchangeState};
use crate::model::{AllocationLine, AllocationResult, MatchStatus, OpenLine};

/// Link between a committed movement and one open line (or installment).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialReconcile {
    pub id: String,
    pub movement_id: String,
    pub open_line_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installment: Option<u32>,
    pub document: String,
    /// Residual decrement in the open line's currency.
    pub amount: Decimal,
    /// Residual decrement in company currency at booking rates.
    pub balance: Decimal,
    pub full: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_entry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub movement_id: String,
    pub lines: Vec<AllocationLine>,
    pub partials: Vec<PartialReconcile>,
}

#[derive(Debug, Default)]
struct BookState {
    lines: BTreeMap<String, OpenLine>,
    settlements: BTreeMap<String, Settlement>,
    exchange: BTreeMap<String, ExchangeDifferenceEntry>,
    fees_accounts: BTreeMap<String, String>,
    posted_documents: BTreeSet<String>,
}

#[derive(Debug)]
pub struct Book {
    fees_prefix: String,
    state: Mutex<BookState>,
}

impl Book {
    pub fn new(ctx: &ReconciliationContext) -> Self {
        let fees_accounts = ctx
            .journals
            .iter()
            .filter_map(|(journal, cfg)| cfg.fees.clone().map(|acc| (journal.clone(), acc)))
            .collect();
        Self {
            fees_prefix: ctx.accounts.fees_prefix.clone(),
            state: Mutex::new(BookState {
                fees_accounts,
                ..BookState::default()
            }),
        }
    }

    pub fn with_lines(ctx: &ReconciliationContext, lines: impl IntoIterator<Item = OpenLine>) -> Self {
        let book = Self::new(ctx);
        for line in lines {
            book.insert(line);
        }
        book
    }

    fn state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Add or replace an open line. A replacement always gets the stored
    /// version + 1, whatever version the caller passed.
    pub fn insert(&self, mut line: OpenLine) {
        let mut state = self.state();
        if let Some(existing) = state.lines.get(&line.id) {
            line.version = existing.version + 1;
        }
        state.lines.insert(line.id.clone(), line);
    }

    pub fn open_line(&self, id: &str) -> Option<OpenLine> {
        self.state().lines.get(id).cloned()
    }

    pub fn open_lines(&self) -> Vec<OpenLine> {
        self.state().lines.values().cloned().collect()
    }

    /// Current copies of the requested lines, in request order.
    pub fn snapshot(&self, ids: &[String]) -> Result<Vec<OpenLine>, BankrecError> {
        let state = self.state();
        ids.iter()
            .map(|id| {
                state
                    .lines
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BankrecError::UnknownOpenLine(id.clone()))
            })
            .collect()
    }

    pub fn settlement(&self, movement_id: &str) -> Option<Settlement> {
        self.state().settlements.get(movement_id).cloned()
    }

    pub fn is_reconciled(&self, movement_id: &str) -> bool {
        self.state().settlements.contains_key(movement_id)
    }

    pub fn exchange_entry(&self, id: &str) -> Option<ExchangeDifferenceEntry> {
        self.state().exchange.get(id).cloned()
    }

    pub fn exchange_entries(&self) -> Vec<ExchangeDifferenceEntry> {
        self.state().exchange.values().cloned().collect()
    }

    pub fn is_posted(&self, document: &str) -> bool {
        self.state().posted_documents.contains(document)
    }

    // -----------------------------------------------------------------------
    // Commit / undo
    // -----------------------------------------------------------------------

    /// Apply a validated proposal: decrement residuals, record partials and
    /// store its exchange entries (posted at once if the document already is).
    ///
    /// `expected_versions` are the versions of the open lines the proposal was
    /// built from. Nothing is written unless every check passes.
    pub fn commit(
        &self,
        result: &AllocationResult,
        expected_versions: &BTreeMap<String, u64>,
    ) -> Result<Settlement, BankrecError> {
        let mut state = self.state();
        let movement_id = result.movement_id.as_str();

        if state.settlements.contains_key(movement_id) {
            return Err(BankrecError::AlreadyReconciled(movement_id.to_string()));
        }

        for (id, version) in expected_versions {
            let line = state
                .lines
                .get(id)
                .ok_or_else(|| BankrecError::UnknownOpenLine(id.clone()))?;
            if line.version != *version {
                return Err(BankrecError::ConcurrentModification {
                    open_line_id: id.clone(),
                });
            }
        }

        // Never overwrite an entry left by an earlier commit of this movement.
        let mut entries: Vec<ExchangeDifferenceEntry> = Vec::with_capacity(result.exchange_differences.len());
        for entry in &result.exchange_differences {
            let mut entry = entry.clone();
            entry.id = free_id(&entry.id, |id| {
                state.exchange.contains_key(id) || entries.iter().any(|e| e.id == id)
            });
            if state.posted_documents.contains(&entry.document) {
                entry.post()?;
            }
            entries.push(entry);
        }

        // Aggregate per open line; installments of one line share its residual.
        let mut deltas: BTreeMap<&str, (Decimal, Decimal)> = BTreeMap::new();
        for m in &result.matches {
            let entry = deltas.entry(m.candidate.open_line_id.as_str()).or_default();
            entry.0 += m.paid;
            entry.1 += m.paid_booked;
        }
        for (id, (paid, _)) in &deltas {
            let line = state
                .lines
                .get(*id)
                .ok_or_else(|| BankrecError::UnknownOpenLine(id.to_string()))?;
            let left = line.residual - paid;
            if !left.is_zero() && left.is_sign_negative() != line.residual.is_sign_negative() {
                return Err(BankrecError::OverAllocation {
                    open_line_id: id.to_string(),
                    requested: *paid,
                    residual: line.residual,
                });
            }
        }

        for (id, (paid, paid_booked)) in &deltas {
            if let Some(line) = state.lines.get_mut(*id) {
                line.residual -= paid;
                if let Some(balance) = line.residual_balance.as_mut() {
                    *balance -= paid_booked;
                }
                line.version += 1;
            }
        }

        let partials: Vec<PartialReconcile> = result
            .matches
            .iter()
            .map(|m| {
                let id = format!("partial:{movement_id}:{}", m.candidate);
                let exchange_entry = entries
                    .iter()
                    .find(|e| e.partial_id == id)
                    .map(|e| e.id.clone());
                let document = state
                    .lines
                    .get(&m.candidate.open_line_id)
                    .map(|l| l.document.clone())
                    .unwrap_or_default();
                PartialReconcile {
                    id,
                    movement_id: movement_id.to_string(),
                    open_line_id: m.candidate.open_line_id.clone(),
                    installment: m.candidate.installment,
                    document,
                    amount: m.paid,
                    balance: m.paid_booked,
                    full: m.status == MatchStatus::Full,
                    exchange_entry,
                }
            })
            .collect();

        for entry in entries {
            info!(entry = %entry.id, amount = %entry.amount, state = %entry.state, "exchange difference recorded");
            state.exchange.insert(entry.id.clone(), entry);
        }

        let settlement = Settlement {
            movement_id: movement_id.to_string(),
            lines: result.lines.clone(),
            partials,
        };
        state
            .settlements
            .insert(movement_id.to_string(), settlement.clone());
        info!(movement = %movement_id, partials = settlement.partials.len(), "settlement committed");
        Ok(settlement)
    }

    /// Undo a committed settlement. Residuals are restored exactly; draft
    /// exchange entries are discarded, posted ones reversed.
    pub fn unreconcile(&self, movement_id: &str) -> Result<Settlement, BankrecError> {
        let mut state = self.state();
        let settlement = state
            .settlements
            .remove(movement_id)
            .ok_or_else(|| BankrecError::UnknownMovement(movement_id.to_string()))?;

        for partial in &settlement.partials {
            undo_partial(&mut state, partial)?;
        }
        info!(movement = %movement_id, "settlement undone");
        Ok(settlement)
    }

    // -----------------------------------------------------------------------
    // Parent documents
    // -----------------------------------------------------------------------

    /// Mark a document posted and post its draft exchange entries.
    pub fn post_document(&self, document: &str) -> Result<Vec<String>, BankrecError> {
        let mut state = self.state();
        state.posted_documents.insert(document.to_string());
        let mut posted = Vec::new();
        for entry in state.exchange.values_mut() {
            if entry.document == document && entry.state == ExchangeState::Draft {
                entry.post()?;
                posted.push(entry.id.clone());
            }
        }
        if !posted.is_empty() {
            info!(%document, entries = posted.len(), "exchange entries posted");
        }
        Ok(posted)
    }

    /// Return a document to draft. Reconciliations against its lines are undone
    /// together with their exchange entries. Returns the undone partial ids.
    pub fn revert_document(&self, document: &str) -> Result<Vec<String>, BankrecError> {
        let mut state = self.state();
        state.posted_documents.remove(document);

        let mut undone = Vec::new();
        for movement_id in state.settlements.keys().cloned().collect::<Vec<_>>() {
            let Some(mut settlement) = state.settlements.remove(&movement_id) else {
                continue;
            };
            let (affected, kept): (Vec<_>, Vec<_>) = settlement
                .partials
                .into_iter()
                .partition(|p| p.document == document);
            for partial in &affected {
                undo_partial(&mut state, partial)?;
                undone.push(partial.id.clone());
            }
            let affected_lines: BTreeSet<&str> =
                affected.iter().map(|p| p.open_line_id.as_str()).collect();
            for line in &mut settlement.lines {
                if line
                    .open_line_id
                    .as_deref()
                    .is_some_and(|id| affected_lines.contains(id))
                {
                    line.reconciled = false;
                }
            }
            settlement.partials = kept;
            state.settlements.insert(movement_id, settlement);
        }

        if !undone.is_empty() {
            warn!(%document, partials = undone.len(), "document reverted; reconciliations undone");
        }
        Ok(undone)
    }
}

fn undo_partial(state: &mut BookState, partial: &PartialReconcile) -> Result<(), BankrecError> {
    if let Some(line) = state.lines.get_mut(&partial.open_line_id) {
        line.residual += partial.amount;
        if let Some(balance) = line.residual_balance.as_mut() {
            *balance += partial.balance;
        }
        line.version += 1;
    }

    let Some(entry_id) = &partial.exchange_entry else {
        return Ok(());
    };
    let reversal_id = free_id(&format!("{entry_id}:reversal"), |id| state.exchange.contains_key(id));
    let Some(entry) = state.exchange.get_mut(entry_id) else {
        return Ok(());
    };
    match entry.state {
        ExchangeState::Draft => {
            entry.discard()?;
            info!(entry = %entry_id, "exchange entry discarded");
        }
        ExchangeState::Posted => {
            let reversal = entry.reversal(reversal_id)?;
            info!(entry = %entry_id, "exchange entry reversed");
            state.exchange.insert(reversal.id.clone(), reversal);
        }
        ExchangeState::Discarded => {}
    }
    Ok(())
}

/// `base`, or `base@2`, `base@3`, ... for the first id not yet taken.
fn free_id(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let id = format!("{base}@{n}");
        if !taken(&id) {
            return id;
        }
        n += 1;
    }
}

impl FeesAccountProvider for Book {
    /// Provisioned on first use per journal, then reused.
    fn fees_account(&self, journal: &str) -> String {
        let mut state = self.state();
        if let Some(account) = state.fees_accounts.get(journal) {
            return account.clone();
        }
        let account = format!("{}-{journal}", self.fees_prefix);
        info!(%journal, %account, "fees account created");
        state
            .fees_accounts
            .insert(journal.to_string(), account.clone());
        account
    }
}
