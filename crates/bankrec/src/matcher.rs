use std::collections::BTreeSet;

use crate::config::AutoMatchConfig;
use crate::model::{BankMovement, OpenLine};

/// Auto-match candidate search.
pub trait CandidateFinder {
    /// Ids of open lines worth matching against `movement`, best first.
    fn find_candidates(&self, movement: &BankMovement, open_lines: &[OpenLine]) -> Vec<String>;
}

/// Ranks open lines by how well their reference appears in the statement label.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    config: AutoMatchConfig,
}

struct Scored<'a> {
    line: &'a OpenLine,
    score: f64,
    exact_amount: bool,
    days: i64,
    prior: bool,
}

impl LabelMatcher {
    pub fn new(config: AutoMatchConfig) -> Self {
        Self { config }
    }
}

impl CandidateFinder for LabelMatcher {
    fn find_candidates(&self, movement: &BankMovement, open_lines: &[OpenLine]) -> Vec<String> {
        let mut scored: Vec<Scored> = open_lines
            .iter()
            .filter(|l| !l.residual.is_zero())
            .filter(|l| l.residual.is_sign_negative() == movement.amount.is_sign_negative())
            .filter_map(|line| {
                let partner_match = match (&movement.partner, &line.partner) {
                    (Some(a), Some(b)) if a != b => return None,
                    (Some(_), Some(_)) => true,
                    _ => false,
                };
                let score = label_score(&line.reference, &movement.label);
                if score < self.config.min_label_score && !partner_match {
                    return None;
                }
                Some(Scored {
                    line,
                    score,
                    exact_amount: amount_matches(movement, line),
                    days: (movement.date - line.date).num_days().abs(),
                    prior: line.date <= movement.date,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.exact_amount.cmp(&a.exact_amount))
                .then_with(|| a.days.cmp(&b.days))
                .then_with(|| b.prior.cmp(&a.prior))
                .then_with(|| a.line.id.cmp(&b.line.id))
        });

        scored
            .into_iter()
            .take(self.config.max_candidates)
            .map(|s| s.line.id.clone())
            .collect()
    }
}

fn amount_matches(movement: &BankMovement, line: &OpenLine) -> bool {
    match &movement.foreign {
        Some(f) if f.currency == line.currency => line.residual == f.amount,
        Some(_) => false,
        None => line.booked_balance() == movement.amount,
    }
}

/// Lowercase alphanumeric tokens.
fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// 1.0 when the whole reference appears in the label (separators ignored),
/// otherwise the share of reference tokens found among the label tokens.
pub fn label_score(reference: &str, label: &str) -> f64 {
    let reference = tokens(reference);
    if reference.is_empty() {
        return 0.0;
    }
    let label = tokens(label);
    if label.concat().contains(&reference.concat()) {
        return 1.0;
    }
    let label: BTreeSet<&str> = label.iter().map(String::as_str).collect();
    let found = reference.iter().filter(|t| label.contains(t.as_str())).count();
    found as f64 / reference.len() as f64
}
