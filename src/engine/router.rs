//! Approval routing: who may sign off or reject at each gate.
//!
//! Advancing requires the gate's exact holder. Rejecting is open to the
//! holder and every role above it. Below Admin, the actor's department and
//! cohort must match the reservation owner's.

use crate::model::{Actor, Reservation, Role, Scope};

use super::machine::{self, Gate, Step};
use super::EngineError;

fn rank(role: Role) -> u8 {
    match role {
        Role::Student => 0,
        Role::Representative => 1,
        Role::Staff => 2,
        Role::Admin => 3,
    }
}

fn in_scope(actor: &Scope, owner: &Scope) -> bool {
    actor.department == owner.department && actor.cohort == owner.cohort
}

fn may_act(role: Role, step: &Step) -> bool {
    let gate = step.gate();
    match step {
        Step::Advance { .. } => role == gate.holder(),
        Step::Reject { .. } => rank(role) >= rank(gate.holder()),
    }
}

pub fn authorize(actor: &Actor, reservation: &Reservation, step: &Step) -> Result<(), EngineError> {
    if !actor.active {
        return Err(EngineError::unauthorized(format!("actor {} is inactive", actor.id)));
    }
    let role = actor.effective_role();
    if actor.id == reservation.requester && role != Role::Admin {
        return Err(EngineError::unauthorized(
            "cannot approve or reject your own reservation",
        ));
    }
    if !may_act(role, step) {
        return Err(EngineError::unauthorized(format!(
            "{} cannot act at the {} gate",
            role.label(),
            step.gate().label()
        )));
    }
    if role != Role::Admin && !in_scope(&actor.scope, &reservation.owner_scope) {
        return Err(EngineError::unauthorized(format!(
            "{} is outside {}",
            reservation.owner_scope, actor.scope
        )));
    }
    Ok(())
}

/// True if `actor` may advance `reservation` from its current status.
pub fn can_advance(actor: &Actor, reservation: &Reservation) -> bool {
    let (Some(gate), Some(to)) = (
        machine::gate(reservation.status),
        machine::advance(reservation.status),
    ) else {
        return false;
    };
    authorize(actor, reservation, &Step::Advance { gate, to }).is_ok()
}

/// Gate an actor of `role` holds, if any.
pub fn held_gate(role: Role) -> Option<Gate> {
    match role {
        Role::Student => None,
        Role::Representative => Some(Gate::Cohort),
        Role::Staff => Some(Gate::Staff),
        Role::Admin => Some(Gate::Final),
    }
}
