//! Transition rules for the delivery and membership state machines.
//!
//! The rule tables are data consulted by a single entry point per machine.
//! A transition outside the table yields [`Transition::Rejected`]; callers
//! log and drop it — duplicate or out-of-order client replays must never
//! surface as errors.

use crate::entities::{DeliveryState, MembershipState};

/// Outcome of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The edge exists; the new state to persist.
    Advanced(S),
    /// No such edge; the caller keeps the current state.
    Rejected,
}

impl<S> Transition<S> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Allowed successors for a delivery state.
fn delivery_successors(state: DeliveryState) -> &'static [DeliveryState] {
    use DeliveryState::{Aborted, Confirmed, Delivered, Delivering, Failed, New};
    match state {
        New => &[Delivering, Aborted],
        Delivering => &[Delivered, Failed, Aborted],
        Delivered => &[Confirmed, Aborted],
        Confirmed | Failed | Aborted => &[],
    }
}

/// Validate a delivery transition against the adjacency table.
pub fn transition(current: DeliveryState, requested: DeliveryState) -> Transition<DeliveryState> {
    if delivery_successors(current).contains(&requested) {
        Transition::Advanced(requested)
    } else {
        Transition::Rejected
    }
}

/// Allowed successors for a membership state.
fn membership_successors(state: MembershipState) -> &'static [MembershipState] {
    use MembershipState::{Invited, Joined, NotInvolved, Removed, Suspended};
    match state {
        NotInvolved => &[Invited],
        Invited => &[Joined, Removed],
        Joined => &[Suspended, Removed],
        Suspended => &[Joined, Removed],
        Removed => &[],
    }
}

/// Validate a membership transition against the adjacency table.
pub fn membership_transition(
    current: MembershipState,
    requested: MembershipState,
) -> Transition<MembershipState> {
    if membership_successors(current).contains(&requested) {
        Transition::Advanced(requested)
    } else {
        Transition::Rejected
    }
}
