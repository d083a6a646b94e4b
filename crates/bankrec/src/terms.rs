//! Payment-term schedule.

use crate::model::{Installment, OpenLine};

pub trait PaymentTermSchedule {
    /// Installments of the open line's payment term, ordered by due date.
    /// Empty when the line has no installment structure.
    fn installments(&self, line: &OpenLine) -> Vec<Installment>;
}

/// Schedule stored on the open line itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredSchedule;

impl PaymentTermSchedule for StoredSchedule {
    fn installments(&self, line: &OpenLine) -> Vec<Installment> {
        let mut plan = line.installments.clone();
        plan.sort_by_key(|i| i.due_date);
        plan
    }
}
