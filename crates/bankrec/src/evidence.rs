use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::AllocationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementStatus {
    /// Nothing left on suspense.
    Reconciled,
    /// Some candidates matched, the rest sits on suspense.
    OpenBalance,
    /// No candidate matched; the whole amount sits on suspense.
    Unmatched,
    Error,
}

impl std::fmt::Display for MovementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconciled => write!(f, "reconciled"),
            Self::OpenBalance => write!(f, "open_balance"),
            Self::Unmatched => write!(f, "unmatched"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl MovementStatus {
    pub fn of(result: &AllocationResult) -> Self {
        if result.fully_reconciled {
            Self::Reconciled
        } else if result.matches.is_empty() && result.lines.len() <= 2 {
            Self::Unmatched
        } else {
            Self::OpenBalance
        }
    }
}

/// What happened to one movement of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MovementOutcome {
    pub movement_id: String,
    pub status: MovementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AllocationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub committed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub movements: usize,
    pub reconciled: usize,
    pub open_balance: usize,
    pub unmatched: usize,
    pub errors: usize,
    pub committed: usize,
    pub exchange_differences: usize,
    pub warnings: usize,
    /// Proposal lines per kind, across all movements.
    pub lines_by_kind: BTreeMap<String, usize>,
}

/// Compute summary statistics from per-movement outcomes.
pub fn compute_summary(outcomes: &[MovementOutcome]) -> RunSummary {
    let mut summary = RunSummary {
        movements: outcomes.len(),
        ..RunSummary::default()
    };

    for o in outcomes {
        match o.status {
            MovementStatus::Reconciled => summary.reconciled += 1,
            MovementStatus::OpenBalance => summary.open_balance += 1,
            MovementStatus::Unmatched => summary.unmatched += 1,
            MovementStatus::Error => summary.errors += 1,
        }
        if o.committed {
            summary.committed += 1;
        }
        if let Some(r) = &o.result {
            summary.exchange_differences += r.exchange_differences.len();
            summary.warnings += r.warnings.len();
            for line in &r.lines {
                *summary.lines_by_kind.entry(line.kind.to_string()).or_insert(0) += 1;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AllocationLine, LineKind};
    use rust_decimal_macros::dec;

    fn result(fully_reconciled: bool, kinds: &[LineKind]) -> AllocationResult {
        AllocationResult {
            movement_id: "st".into(),
            lines: kinds
                .iter()
                .enumerate()
                .map(|(i, k)| AllocationLine::new(format!("l{i}"), *k, "512000", dec!(0), dec!(0), "EUR"))
                .collect(),
            fully_reconciled,
            matches: Vec::new(),
            untouched: Vec::new(),
            exchange_differences: Vec::new(),
            warnings: Vec::new(),
            reconcile_model: None,
        }
    }

    fn outcome(status: MovementStatus, result: Option<AllocationResult>) -> MovementOutcome {
        MovementOutcome {
            movement_id: "st".into(),
            status,
            result,
            error: None,
            committed: status != MovementStatus::Error,
        }
    }

    #[test]
    fn summary_counts() {
        let outcomes = vec![
            outcome(
                MovementStatus::Reconciled,
                Some(result(true, &[LineKind::Liquidity, LineKind::Settlement, LineKind::Settlement])),
            ),
            outcome(
                MovementStatus::Unmatched,
                Some(result(false, &[LineKind::Liquidity, LineKind::OpenBalance])),
            ),
            outcome(MovementStatus::Error, None),
        ];
        let summary = compute_summary(&outcomes);
        assert_eq!(summary.movements, 3);
        assert_eq!(summary.reconciled, 1);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.lines_by_kind["settlement"], 2);
        assert_eq!(summary.lines_by_kind["liquidity"], 2);
    }

    #[test]
    fn status_from_result() {
        let unmatched = result(false, &[LineKind::Liquidity, LineKind::OpenBalance]);
        assert_eq!(MovementStatus::of(&unmatched), MovementStatus::Unmatched);
        let manual = result(false, &[LineKind::Liquidity, LineKind::Manual, LineKind::OpenBalance]);
        assert_eq!(MovementStatus::of(&manual), MovementStatus::OpenBalance);
        assert_eq!(MovementStatus::of(&result(true, &[])), MovementStatus::Reconciled);
    }
}
