//! `visigrid-bankrec`: bank statement line reconciliation allocator.
//!
//! Pure engine crate: receives pre-loaded movements and open lines, returns
//! balanced allocation proposals and commits them to a shared [`Book`].
//! Currency conversion, tax expansion and payment terms sit behind traits.
//! No CLI dependencies.

pub mod book;
pub mod closer;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod exchange;
pub mod matcher;
pub mod model;
pub mod residual;
pub mod scenario;
pub mod session;
pub mod tax;
pub mod terms;

pub use book::{Book, PartialReconcile, Settlement};
pub use config::ReconciliationContext;
pub use currency::{CurrencyConverter, RateTable};
pub use error::BankrecError;
pub use evidence::{MovementOutcome, MovementStatus, RunSummary};
pub use exchange::{ExchangeDifferenceEntry, ExchangeState};
pub use model::{AllocationLine, AllocationResult, BankMovement, LineKind, OpenLine};
pub use scenario::{run, Scenario, ScenarioRun};
pub use session::{LinePatch, Reconciler};
pub use tax::{TaxEngine, TaxTable};
