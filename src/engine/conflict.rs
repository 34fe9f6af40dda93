use crate::config::{BlockingPolicy, Policy};
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Statuses that occupy their slot and exclude overlapping reservations.
pub(crate) fn is_blocking(policy: BlockingPolicy, status: Status) -> bool {
    match policy {
        BlockingPolicy::CommittedOnly => matches!(status, Status::StaffApproved | Status::Approved),
        BlockingPolicy::IncludePending => status != Status::Rejected,
    }
}

/// `start < end`, inside operating hours.
pub(crate) fn validate_window(policy: &Policy, window: &TimeWindow) -> Result<(), EngineError> {
    if !window.is_well_formed() {
        return Err(EngineError::validation(format!(
            "start must be before end ({window})"
        )));
    }
    if !policy.hours.contains(window) {
        return Err(EngineError::validation(format!(
            "{window} is outside operating hours {}",
            policy.hours
        )));
    }
    Ok(())
}

/// Trimmed, non-empty rejection reason.
pub(crate) fn validate_reason(reason: Option<&str>) -> Result<String, EngineError> {
    let reason = reason.map(str::trim).unwrap_or_default();
    if reason.is_empty() {
        return Err(EngineError::validation("rejection requires a reason"));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::validation("rejection reason too long"));
    }
    Ok(reason.to_string())
}

/// First blocking reservation in `day` overlapping `window`, skipping `exclude`.
pub(crate) fn find_conflict<'a>(
    day: &'a DayLedger,
    window: &TimeWindow,
    exclude: Option<ulid::Ulid>,
    policy: BlockingPolicy,
) -> Option<&'a Reservation> {
    day.overlapping(window)
        .filter(|r| Some(r.id) != exclude)
        .find(|r| is_blocking(policy, r.status))
}

pub(crate) fn check_no_conflict(
    day: &DayLedger,
    window: &TimeWindow,
    exclude: Option<ulid::Ulid>,
    policy: BlockingPolicy,
) -> Result<(), EngineError> {
    match find_conflict(day, window, exclude, policy) {
        Some(existing) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                id: existing.id,
                window: existing.slot.window,
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn window(sh: u32, eh: u32) -> TimeWindow {
        TimeWindow::from_hm((sh, 0), (eh, 0)).unwrap()
    }

    fn day_with(entries: &[(u32, u32, Status)]) -> DayLedger {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut day = DayLedger::new(Ulid::new(), date);
        for &(s, e, status) in entries {
            day.insert(Reservation {
                id: Ulid::new(),
                resource_id: day.resource_id,
                requester: Ulid::new(),
                owner_scope: Scope::new("CSE", Some(2)),
                slot: Slot::new(date, window(s, e)),
                status,
                rejection_reason: None,
                created_at: 0,
                updated_at: 0,
            });
        }
        day
    }

    #[test]
    fn blocking_sets() {
        use BlockingPolicy::*;
        assert!(is_blocking(CommittedOnly, Status::Approved));
        assert!(is_blocking(CommittedOnly, Status::StaffApproved));
        assert!(!is_blocking(CommittedOnly, Status::PendingStaffApproval));
        assert!(!is_blocking(CommittedOnly, Status::PendingCohortApproval));
        assert!(!is_blocking(CommittedOnly, Status::Pending));
        assert!(!is_blocking(CommittedOnly, Status::Rejected));

        assert!(is_blocking(IncludePending, Status::Pending));
        assert!(is_blocking(IncludePending, Status::PendingCohortApproval));
        assert!(!is_blocking(IncludePending, Status::Rejected));
    }

    #[test]
    fn window_validation() {
        let policy = Policy::default();
        assert!(validate_window(&policy, &window(9, 10)).is_ok());
        assert!(validate_window(&policy, &window(15, 16)).is_ok());
        assert!(validate_window(&policy, &window(9, 16)).is_ok());
        assert!(matches!(
            validate_window(&policy, &window(10, 10)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_window(&policy, &window(11, 10)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_window(&policy, &window(8, 10)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_window(&policy, &window(15, 17)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn reason_validation() {
        assert_eq!(validate_reason(Some("  room double booked ")).unwrap(), "room double booked");
        assert!(validate_reason(None).is_err());
        assert!(validate_reason(Some("")).is_err());
        assert!(validate_reason(Some("   ")).is_err());
        let long = "x".repeat(MAX_REASON_LEN + 1);
        assert!(validate_reason(Some(&long)).is_err());
    }

    #[test]
    fn pending_reservations_do_not_conflict() {
        let day = day_with(&[
            (9, 10, Status::PendingCohortApproval),
            (9, 10, Status::PendingStaffApproval),
            (9, 10, Status::Rejected),
        ]);
        assert!(find_conflict(&day, &window(9, 10), None, BlockingPolicy::CommittedOnly).is_none());
        assert!(find_conflict(&day, &window(9, 10), None, BlockingPolicy::IncludePending).is_some());
    }

    #[test]
    fn committed_reservations_conflict() {
        let day = day_with(&[(9, 10, Status::StaffApproved), (13, 14, Status::Approved)]);
        let hit = find_conflict(&day, &window(9, 11), None, BlockingPolicy::CommittedOnly).unwrap();
        assert_eq!(hit.slot.window, window(9, 10));
        assert!(find_conflict(&day, &window(13, 15), None, BlockingPolicy::CommittedOnly).is_some());
        assert!(find_conflict(&day, &window(11, 13), None, BlockingPolicy::CommittedOnly).is_none());
    }

    #[test]
    fn back_to_back_reservations_do_not_conflict() {
        let day = day_with(&[(10, 11, Status::Approved)]);
        assert!(check_no_conflict(&day, &window(9, 10), None, BlockingPolicy::CommittedOnly).is_ok());
        assert!(check_no_conflict(&day, &window(11, 12), None, BlockingPolicy::CommittedOnly).is_ok());
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let day = day_with(&[(9, 10, Status::StaffApproved)]);
        let own = day.reservations[0].id;
        assert!(check_no_conflict(&day, &window(9, 10), Some(own), BlockingPolicy::CommittedOnly).is_ok());
        let err = check_no_conflict(&day, &window(9, 10), None, BlockingPolicy::CommittedOnly).unwrap_err();
        assert_eq!(err, EngineError::Conflict { id: own, window: window(9, 10) });
    }
}
