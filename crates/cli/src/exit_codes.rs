//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                              |
//! |---------|------------------|------------------------------------------|
//! | 0       | Universal        | Success                                  |
//! | 1       | Universal        | General error (unspecified)              |
//! | 2       | Universal        | CLI usage error (bad args, missing file) |
//! | 60-69   | bankrec          | Bank statement reconciliation            |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
#[allow(dead_code)]
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
#[allow(dead_code)]
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Bankrec (60-69)
// =============================================================================

/// At least one movement still has an amount on its suspense account,
/// or failed to allocate.
pub const EXIT_BANKREC_OPEN_BALANCE: u8 = 60;

/// Scenario or reconciliation context is invalid (parse error, bad tolerance,
/// duplicate ids, unknown movement in a match).
pub const EXIT_BANKREC_INVALID_CONFIG: u8 = 61;

/// Runtime failure: unreadable files, CSV errors, output write errors.
pub const EXIT_BANKREC_RUNTIME: u8 = 62;

use visigrid_bankrec::BankrecError;

/// Map an engine error to its exit code.
pub fn bankrec_exit_code(err: &BankrecError) -> u8 {
    match err {
        BankrecError::Configuration(_) | BankrecError::ConfigParse(_) => {
            EXIT_BANKREC_INVALID_CONFIG
        }
        _ => EXIT_BANKREC_RUNTIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_invalid_config() {
        assert_eq!(
            bankrec_exit_code(&BankrecError::ConfigParse("x".into())),
            EXIT_BANKREC_INVALID_CONFIG
        );
        assert_eq!(
            bankrec_exit_code(&BankrecError::Io("x".into())),
            EXIT_BANKREC_RUNTIME
        );
    }
}
