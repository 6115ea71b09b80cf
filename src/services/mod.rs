//! Services module for payment reconciliation logic

pub mod clock;
pub mod conflict_checker;
pub mod presentation;
pub mod reconciliation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict_checker::ConflictChecker;
pub use presentation::{follow, render, render_order, PaymentView, Tone};
pub use reconciliation::{
    BookingFlow, InitiateRequest, ProviderCallback, ReconcileError, ReconcileOutcome,
    ReconciliationEvent, ReconciliationService, ReconciliationStage, StatusUpdate, TerminalStatus,
};
