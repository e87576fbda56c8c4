//! The two incoming-payment finite-state machines: [`local`]'s Local
//! Receiver (C7) and [`trampoline`]'s Trampoline Relayer (C8). Both share the
//! same construction/shutdown skeleton and react to the same
//! [`InFlightPayments`] snapshots, but only the trampoline variant also
//! dispatches and supervises a correlated outgoing send.
//!
//! [`InFlightPayments`]: crate::htlc::InFlightPayments

/// Local Receiver FSM (C7): decides fulfill/abort for a terminal incoming
/// payment.
pub mod local;
/// Trampoline Relayer FSM (C8): decides fulfill/abort for a routed incoming
/// payment, and manages the correlated outgoing send.
pub mod trampoline;
