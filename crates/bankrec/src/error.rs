use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::exchange::ExchangeState;

#[derive(Debug, Clone, PartialEq)]
pub enum BankrecError {
    /// Missing suspense account, tax without account, etc. Raised before any line is emitted.
    Configuration(String),
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// No rate available to convert between two currencies at a date.
    CurrencyMismatch {
        from: String,
        to: String,
        date: NaiveDate,
    },
    /// A forced allocation exceeds the open line's residual beyond tolerance.
    OverAllocation {
        open_line_id: String,
        requested: Decimal,
        residual: Decimal,
    },
    /// The open line's residual changed between read and write.
    ConcurrentModification { open_line_id: String },
    /// Exchange-difference entry cannot move between these states.
    InvalidTransition {
        entry_id: String,
        from: ExchangeState,
        to: ExchangeState,
    },
    UnknownMovement(String),
    UnknownLine(String),
    UnknownOpenLine(String),
    LineNotEditable { line_id: String, reason: &'static str },
    AlreadyReconciled(String),
    /// Internal invariant: proposal lines do not sum to zero.
    Unbalanced {
        movement_id: String,
        difference: Decimal,
    },
    /// Field parse error while loading records.
    Parse {
        source: String,
        record_id: String,
        value: String,
    },
    /// Missing required column in input data.
    MissingColumn { source: String, column: String },
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for BankrecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::CurrencyMismatch { from, to, date } => {
                write!(f, "no rate to convert {from} to {to} on {date}")
            }
            Self::OverAllocation { open_line_id, requested, residual } => write!(
                f,
                "open line '{open_line_id}': allocation of {requested} exceeds residual {residual}"
            ),
            Self::ConcurrentModification { open_line_id } => {
                write!(f, "open line '{open_line_id}' was modified concurrently")
            }
            Self::InvalidTransition { entry_id, from, to } => {
                write!(f, "exchange entry '{entry_id}': cannot go from {from} to {to}")
            }
            Self::UnknownMovement(id) => write!(f, "unknown bank movement: {id}"),
            Self::UnknownLine(id) => write!(f, "unknown allocation line: {id}"),
            Self::UnknownOpenLine(id) => write!(f, "unknown open line: {id}"),
            Self::LineNotEditable { line_id, reason } => {
                write!(f, "line '{line_id}' cannot be edited: {reason}")
            }
            Self::AlreadyReconciled(id) => write!(f, "bank movement '{id}' is already reconciled"),
            Self::Unbalanced { movement_id, difference } => write!(
                f,
                "allocation for '{movement_id}' is unbalanced by {difference}"
            ),
            Self::Parse { source, record_id, value } => {
                write!(f, "{source}, record '{record_id}': cannot parse '{value}'")
            }
            Self::MissingColumn { source, column } => {
                write!(f, "{source}: missing column '{column}'")
            }
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for BankrecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_open_line() {
        let err = BankrecError::OverAllocation {
            open_line_id: "INV/2026/0001".into(),
            requested: Decimal::new(60000, 2),
            residual: Decimal::new(50000, 2),
        };
        let msg = err.to_string();
        assert!(msg.contains("INV/2026/0001"));
        assert!(msg.contains("600.00"));
    }

    #[test]
    fn display_transition() {
        let err = BankrecError::InvalidTransition {
            entry_id: "exch_1".into(),
            from: ExchangeState::Posted,
            to: ExchangeState::Discarded,
        };
        assert_eq!(
            err.to_string(),
            "exchange entry 'exch_1': cannot go from posted to discarded"
        );
    }
}
