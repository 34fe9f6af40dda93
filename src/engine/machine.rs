//! Booking state machine.
//!
//! The transition table is chain-independent: each non-terminal status has
//! exactly one gate and one forward successor. The configured chain only
//! decides where a submission enters.

use crate::config::ApprovalChain;
use crate::model::{Role, Status};

use super::EngineError;

/// An approval stage and the role that signs it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Cohort,
    Staff,
    Final,
}

impl Gate {
    pub fn holder(&self) -> Role {
        match self {
            Gate::Cohort => Role::Representative,
            Gate::Staff => Role::Staff,
            Gate::Final => Role::Admin,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Gate::Cohort => "cohort",
            Gate::Staff => "staff",
            Gate::Final => "final",
        }
    }
}

/// A validated move out of the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advance { gate: Gate, to: Status },
    Reject { gate: Gate },
}

impl Step {
    pub fn gate(&self) -> Gate {
        match self {
            Step::Advance { gate, .. } | Step::Reject { gate } => *gate,
        }
    }

    pub fn target(&self) -> Status {
        match self {
            Step::Advance { to, .. } => *to,
            Step::Reject { .. } => Status::Rejected,
        }
    }
}

/// Where a new submission starts, by the submitter's effective role.
pub fn initial_status(chain: ApprovalChain, role: Role) -> Status {
    match (chain, role) {
        (_, Role::Admin) => Status::Approved,
        (ApprovalChain::TwoStage, _) => Status::Pending,
        (ApprovalChain::FourStage, Role::Student) => Status::PendingCohortApproval,
        (ApprovalChain::FourStage, Role::Representative) => Status::PendingStaffApproval,
        (ApprovalChain::FourStage, Role::Staff) => Status::StaffApproved,
    }
}

/// Gate guarding the exit of `status`. `None` for terminal statuses.
pub fn gate(status: Status) -> Option<Gate> {
    match status {
        Status::PendingCohortApproval => Some(Gate::Cohort),
        Status::PendingStaffApproval => Some(Gate::Staff),
        Status::StaffApproved | Status::Pending => Some(Gate::Final),
        Status::Approved | Status::Rejected => None,
    }
}

/// Forward successor of `status`.
pub fn advance(status: Status) -> Option<Status> {
    match status {
        Status::PendingCohortApproval => Some(Status::PendingStaffApproval),
        Status::PendingStaffApproval => Some(Status::StaffApproved),
        Status::StaffApproved | Status::Pending => Some(Status::Approved),
        Status::Approved | Status::Rejected => None,
    }
}

/// Check that `to` is reachable from `from` in one step.
pub fn plan(from: Status, to: Status) -> Result<Step, EngineError> {
    let invalid = EngineError::InvalidTransition { from, to };
    let gate = gate(from).ok_or_else(|| invalid.clone())?;
    if to == Status::Rejected {
        return Ok(Step::Reject { gate });
    }
    match advance(from) {
        Some(next) if next == to => Ok(Step::Advance { gate, to }),
        _ => Err(invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 6] = [
        Status::Pending,
        Status::PendingCohortApproval,
        Status::PendingStaffApproval,
        Status::StaffApproved,
        Status::Approved,
        Status::Rejected,
    ];

    #[test]
    fn four_stage_entry_points() {
        let c = ApprovalChain::FourStage;
        assert_eq!(initial_status(c, Role::Student), Status::PendingCohortApproval);
        assert_eq!(initial_status(c, Role::Representative), Status::PendingStaffApproval);
        assert_eq!(initial_status(c, Role::Staff), Status::StaffApproved);
        assert_eq!(initial_status(c, Role::Admin), Status::Approved);
    }

    #[test]
    fn two_stage_entry_points() {
        let c = ApprovalChain::TwoStage;
        assert_eq!(initial_status(c, Role::Student), Status::Pending);
        assert_eq!(initial_status(c, Role::Representative), Status::Pending);
        assert_eq!(initial_status(c, Role::Staff), Status::Pending);
        assert_eq!(initial_status(c, Role::Admin), Status::Approved);
    }

    #[test]
    fn forward_chain() {
        assert_eq!(
            plan(Status::PendingCohortApproval, Status::PendingStaffApproval),
            Ok(Step::Advance { gate: Gate::Cohort, to: Status::PendingStaffApproval })
        );
        assert_eq!(
            plan(Status::PendingStaffApproval, Status::StaffApproved),
            Ok(Step::Advance { gate: Gate::Staff, to: Status::StaffApproved })
        );
        assert_eq!(
            plan(Status::StaffApproved, Status::Approved),
            Ok(Step::Advance { gate: Gate::Final, to: Status::Approved })
        );
        assert_eq!(
            plan(Status::Pending, Status::Approved),
            Ok(Step::Advance { gate: Gate::Final, to: Status::Approved })
        );
    }

    #[test]
    fn skipping_and_backward_moves_rejected() {
        for (from, to) in [
            (Status::PendingCohortApproval, Status::StaffApproved),
            (Status::PendingCohortApproval, Status::Approved),
            (Status::PendingStaffApproval, Status::Approved),
            (Status::StaffApproved, Status::PendingStaffApproval),
            (Status::PendingStaffApproval, Status::PendingCohortApproval),
            (Status::StaffApproved, Status::StaffApproved),
            (Status::Pending, Status::StaffApproved),
            (Status::PendingCohortApproval, Status::Pending),
        ] {
            assert_eq!(plan(from, to), Err(EngineError::InvalidTransition { from, to }));
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for from in [Status::Approved, Status::Rejected] {
            for to in ALL {
                assert!(matches!(plan(from, to), Err(EngineError::InvalidTransition { .. })));
            }
        }
    }

    #[test]
    fn rejection_reachable_from_every_open_state() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            let step = plan(from, Status::Rejected).unwrap();
            assert_eq!(step.target(), Status::Rejected);
            assert_eq!(Some(step.gate()), gate(from));
        }
    }

    #[test]
    fn gate_holders() {
        assert_eq!(Gate::Cohort.holder(), Role::Representative);
        assert_eq!(Gate::Staff.holder(), Role::Staff);
        assert_eq!(Gate::Final.holder(), Role::Admin);
    }
}
