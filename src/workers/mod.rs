//! Background tasks: per-order status polling and restart recovery

pub mod order_recovery;
pub mod status_poller;

pub use order_recovery::{OrderRecoveryWorker, RecoverySummary};
pub use status_poller::{PollOutcome, PollTick, PollerHandle, PollerState, StatusPoller};
