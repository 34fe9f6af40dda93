use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only.
pub type Ms = i64;

/// Half-open time-of-day window `[start, end)`.
///
/// Construction never panics: a window with `start >= end` is representable so
/// that the engine can reject it with a validation error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build a window from `(hour, minute)` pairs. `None` if either is not a valid time.
    pub fn from_hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0)?,
            end: NaiveTime::from_hms_opt(end.0, end.1, 0)?,
        })
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// A calendar date plus a time window on that date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl Slot {
    pub fn new(date: NaiveDate, window: TimeWindow) -> Self {
        Self { date, window }
    }

    /// Slots only overlap on the same date.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.window.overlaps(&other.window)
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date, self.window)
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Representative,
    Staff,
    Admin,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Representative => "representative",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

/// Organizational scope: department code plus optional cohort (year).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub department: String,
    pub cohort: Option<u8>,
}

impl Scope {
    pub fn new(department: impl Into<String>, cohort: Option<u8>) -> Self {
        Self {
            department: department.into(),
            cohort,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cohort {
            Some(year) => write!(f, "{}/year {year}", self.department),
            None => write!(f, "{}", self.department),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    /// Class representative standing. Only meaningful for students.
    #[serde(default)]
    pub is_representative: bool,
    pub scope: Scope,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Actor {
    pub fn new(id: Ulid, role: Role, scope: Scope) -> Self {
        Self {
            id,
            name: None,
            role,
            is_representative: false,
            scope,
            active: true,
        }
    }

    /// Role used for routing: a representative student acts as a Representative.
    pub fn effective_role(&self) -> Role {
        match self.role {
            Role::Student if self.is_representative => Role::Representative,
            other => other,
        }
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Lab,
    Classroom,
    Hall,
    Equipment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Available,
    Unavailable,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    pub capacity: u32,
    pub status: ResourceStatus,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Entry state of the two-stage chain.
    Pending,
    PendingCohortApproval,
    PendingStaffApproval,
    StaffApproved,
    Approved,
    Rejected,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Approved | Status::Rejected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::PendingCohortApproval => "pending_cohort_approval",
            Status::PendingStaffApproval => "pending_staff_approval",
            Status::StaffApproved => "staff_approved",
            Status::Approved => "approved",
            Status::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester: Ulid,
    /// Requester's scope at submission time; approval routing matches against it.
    pub owner_scope: Scope,
    pub slot: Slot,
    pub status: Status,
    pub rejection_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// All reservations of one resource on one date. This is the unit of locking.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    /// Sorted by `slot.window.start`.
    pub reservations: Vec<Reservation>,
}

impl DayLedger {
    pub fn new(resource_id: Ulid, date: NaiveDate) -> Self {
        Self {
            resource_id,
            date,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by window start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.slot.window.start <= reservation.slot.window.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose window overlaps `query`.
    /// Entries starting at or after `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &TimeWindow) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.slot.window.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.slot.window.end > query.start)
    }
}

/// WAL record format. Flat variants, one per committed change.
/// Externally tagged: bincode cannot decode internally tagged enums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: u32,
        status: ResourceStatus,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: u32,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: ResourceStatus,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        requester: Ulid,
        owner_scope: Scope,
        slot: Slot,
        status: Status,
        created_at: Ms,
    },
    ReservationTransitioned {
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        actor: Ulid,
        from: Status,
        to: Status,
        reason: Option<String>,
        at: Ms,
    },
    /// Full reservation state, written by compaction in place of its history.
    ReservationSnapshot { reservation: Reservation },
    /// Directory change made at runtime; replayed over the roster file.
    ActorRegistered { actor: Actor },
    ActorDeactivated { id: Ulid },
}

impl Event {
    /// Resource this event belongs to; used for notification fan-out.
    /// Directory events belong to none.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceRegistered { id, .. }
            | Event::ResourceUpdated { id, .. }
            | Event::ResourceStatusChanged { id, .. } => Some(*id),
            Event::ReservationCreated { resource_id, .. }
            | Event::ReservationTransitioned { resource_id, .. } => Some(*resource_id),
            Event::ReservationSnapshot { reservation } => Some(reservation.resource_id),
            Event::ActorRegistered { .. } | Event::ActorDeactivated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(sh: u32, sm: u32, eh: u32, em: u32) -> TimeWindow {
        TimeWindow::from_hm((sh, sm), (eh, em)).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn reservation(w: TimeWindow) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester: Ulid::new(),
            owner_scope: Scope::new("CSE", Some(2)),
            slot: Slot::new(date(2024, 5, 1), w),
            status: Status::Approved,
            rejection_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn window_basics() {
        let w = window(9, 0, 10, 30);
        assert!(w.is_well_formed());
        assert_eq!(w.duration_minutes(), 90);
        assert_eq!(w.to_string(), "09:00-10:30");
        assert!(!window(10, 0, 10, 0).is_well_formed());
        assert!(!window(11, 0, 10, 0).is_well_formed());
    }

    #[test]
    fn window_overlap_is_half_open() {
        let a = window(9, 0, 10, 0);
        let b = window(9, 30, 10, 30);
        let c = window(10, 0, 11, 0);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn window_contains() {
        let day = window(9, 0, 16, 0);
        assert!(day.contains(&window(9, 0, 16, 0)));
        assert!(day.contains(&window(12, 0, 13, 0)));
        assert!(!day.contains(&window(8, 30, 9, 30)));
        assert!(!day.contains(&window(15, 30, 16, 1)));
    }

    #[test]
    fn from_hm_rejects_invalid_times() {
        assert!(TimeWindow::from_hm((25, 0), (26, 0)).is_none());
        assert!(TimeWindow::from_hm((9, 60), (10, 0)).is_none());
    }

    #[test]
    fn slots_on_different_dates_never_overlap() {
        let w = window(9, 0, 10, 0);
        let a = Slot::new(date(2024, 5, 1), w);
        let b = Slot::new(date(2024, 5, 2), w);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn effective_role_promotes_representative_students() {
        let mut actor = Actor::new(Ulid::new(), Role::Student, Scope::new("CSE", Some(2)));
        assert_eq!(actor.effective_role(), Role::Student);
        actor.is_representative = true;
        assert_eq!(actor.effective_role(), Role::Representative);

        // The flag means nothing outside the student role
        let mut staff = Actor::new(Ulid::new(), Role::Staff, Scope::new("CSE", Some(2)));
        staff.is_representative = true;
        assert_eq!(staff.effective_role(), Role::Staff);
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Approved.is_terminal());
        assert!(Status::Rejected.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::PendingCohortApproval.is_terminal());
        assert!(!Status::PendingStaffApproval.is_terminal());
        assert!(!Status::StaffApproved.is_terminal());
    }

    #[test]
    fn ledger_keeps_start_order() {
        let mut day = DayLedger::new(Ulid::new(), date(2024, 5, 1));
        day.insert(reservation(window(13, 0, 14, 0)));
        day.insert(reservation(window(9, 0, 10, 0)));
        day.insert(reservation(window(11, 0, 12, 0)));
        let starts: Vec<_> = day
            .reservations
            .iter()
            .map(|r| r.slot.window.start.format("%H:%M").to_string())
            .collect();
        assert_eq!(starts, vec!["09:00", "11:00", "13:00"]);
    }

    #[test]
    fn ledger_overlapping_skips_neighbours() {
        let mut day = DayLedger::new(Ulid::new(), date(2024, 5, 1));
        day.insert(reservation(window(9, 0, 10, 0)));
        day.insert(reservation(window(10, 30, 11, 30)));
        day.insert(reservation(window(14, 0, 15, 0)));

        let hits: Vec<_> = day.overlapping(&window(10, 0, 11, 0)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].slot.window, window(10, 30, 11, 30));
    }

    #[test]
    fn ledger_overlapping_adjacent_not_included() {
        let mut day = DayLedger::new(Ulid::new(), date(2024, 5, 1));
        day.insert(reservation(window(9, 0, 10, 0)));
        let hits: Vec<_> = day.overlapping(&window(10, 0, 11, 0)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn ledger_overlapping_long_reservation_spanning_query() {
        let mut day = DayLedger::new(Ulid::new(), date(2024, 5, 1));
        day.insert(reservation(window(9, 0, 16, 0)));
        let hits: Vec<_> = day.overlapping(&window(12, 0, 12, 30)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn ledger_get_mut_updates_in_place() {
        let mut day = DayLedger::new(Ulid::new(), date(2024, 5, 1));
        let r = reservation(window(9, 0, 10, 0));
        let id = r.id;
        day.insert(r);
        day.get_mut(&id).unwrap().status = Status::Rejected;
        assert_eq!(day.get(&id).unwrap().status, Status::Rejected);
        assert!(day.get(&Ulid::new()).is_none());
    }

    #[test]
    fn event_resource_id() {
        let rid = Ulid::new();
        let e = Event::ResourceStatusChanged {
            id: rid,
            status: ResourceStatus::Maintenance,
        };
        assert_eq!(e.resource_id(), Some(rid));
        assert_eq!(Event::ActorDeactivated { id: Ulid::new() }.resource_id(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester: Ulid::new(),
            owner_scope: Scope::new("EEE", None),
            slot: Slot::new(date(2024, 6, 1), window(9, 0, 10, 0)),
            status: Status::PendingCohortApproval,
            created_at: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
