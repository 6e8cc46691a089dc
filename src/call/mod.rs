//! Call Zustandsmaschine
//!
//! `CallSession` ist der unveränderliche Zustand, `CallCoordinator`
//! besitzt Media und Peer Session eines Calls.

pub mod coordinator;
pub mod session;

pub use coordinator::{CallCoordinator, CallError, CallEvent};
pub use session::{CallRole, CallSession, CallState, EndReason, FailureReason, TransitionError};
