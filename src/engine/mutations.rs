use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::BlockingPolicy;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, is_blocking, now_ms, validate_reason, validate_window};
use super::machine::{initial_status, plan};
use super::router::authorize;
use super::{Engine, EngineError};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("resource name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Resource registry ────────────────────────────────

    pub async fn register_resource(
        &self,
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: u32,
    ) -> Result<ResourceInfo, EngineError> {
        validate_name(&name)?;
        if capacity == 0 {
            return Err(EngineError::validation("capacity must be positive"));
        }
        let _commit = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let event = Event::ResourceRegistered {
            id,
            name,
            kind,
            capacity,
            status: ResourceStatus::Available,
        };
        self.persist_registry(&event).await?;
        info!(%id, "resource registered");
        self.get_resource_info(id)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: u32,
    ) -> Result<ResourceInfo, EngineError> {
        validate_name(&name)?;
        if capacity == 0 {
            return Err(EngineError::validation("capacity must be positive"));
        }
        let _commit = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if !self.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ResourceUpdated {
            id,
            name,
            kind,
            capacity,
        };
        self.persist_registry(&event).await?;
        self.get_resource_info(id)
    }

    /// Only `Available` resources accept new reservations. Existing
    /// reservations are left as they are.
    pub async fn set_resource_status(
        &self,
        id: Ulid,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, EngineError> {
        let _commit = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        let current = self.get_resource_info(id)?;
        if current.status == status {
            return Ok(current);
        }
        self.persist_registry(&Event::ResourceStatusChanged { id, status })
            .await?;
        info!(%id, ?status, "resource status changed");
        self.get_resource_info(id)
    }

    fn require_available(&self, resource_id: Ulid) -> Result<(), EngineError> {
        let info = self.get_resource_info(resource_id)?;
        if info.status != ResourceStatus::Available {
            return Err(EngineError::validation(format!(
                "resource {} is {:?}",
                info.name, info.status
            )));
        }
        Ok(())
    }

    // ── Directory ────────────────────────────────────────

    /// Add or replace an actor. The change is logged, so it outlives the
    /// roster file it is layered over.
    pub async fn register_actor(&self, actor: Actor) -> Result<Actor, EngineError> {
        let _commit = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        self.directory.admit(&actor)?;
        let event = Event::ActorRegistered {
            actor: actor.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_actor_event(&event)?;
        info!(id = %actor.id, role = actor.effective_role().label(), scope = %actor.scope, "actor registered");
        Ok(actor)
    }

    /// Soft delete. The actor stays resolvable for existing reservations.
    pub async fn deactivate_actor(&self, id: Ulid) -> Result<Actor, EngineError> {
        let _commit = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        let actor = self.lookup_actor(id).await?;
        if !actor.active {
            return Ok(actor);
        }
        let event = Event::ActorDeactivated { id };
        self.wal_append(&event).await?;
        self.apply_actor_event(&event)?;
        info!(%id, "actor deactivated");
        self.lookup_actor(id).await
    }

    // ── Reservations ─────────────────────────────────────

    /// Submit a reservation on behalf of `requester`. It enters the approval
    /// chain at the state their role dictates.
    pub async fn create_reservation(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
        requester: Ulid,
    ) -> Result<Reservation, EngineError> {
        let actor = self.lookup_actor(requester).await?;
        self.create_as(&actor, resource_id, Slot::new(date, window))
            .await
    }

    pub(super) async fn create_as(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        slot: Slot,
    ) -> Result<Reservation, EngineError> {
        if !actor.active {
            return Err(EngineError::unauthorized(format!(
                "actor {} is inactive",
                actor.id
            )));
        }
        validate_window(&self.policy, &slot.window)?;
        self.require_available(resource_id)?;
        let status = initial_status(self.policy.chain, actor.effective_role());

        let mut day = self.day_write(resource_id, slot.date).await;
        if !is_blocking(self.policy.blocking, status) {
            check_draft_caps(&day, actor.id, self.policy.blocking)?;
        }
        check_no_conflict(&day, &slot.window, None, self.policy.blocking)?;

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            resource_id,
            requester: actor.id,
            owner_scope: actor.scope.clone(),
            slot,
            status,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut day, &event).await?;
        metrics::counter!(
            crate::observability::RESERVATIONS_CREATED_TOTAL,
            "status" => status.label()
        )
        .increment(1);
        info!(%id, %resource_id, %slot, %status, requester = %actor.id, "reservation created");

        day.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move a reservation one step along its chain, or reject it.
    ///
    /// Checks run in order: existence, reachability, reason, actor lookup,
    /// routing, then conflicts for a target that blocks. A failure at any
    /// step leaves the reservation unchanged.
    pub async fn transition(
        &self,
        id: Ulid,
        actor_id: Ulid,
        target: Status,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let (resource_id, date) = self.locate(&id)?;

        let mut day = self.day_write(resource_id, date).await;
        let current = day.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let step = plan(current.status, target)?;
        let reason = match target {
            Status::Rejected => Some(validate_reason(reason.as_deref())?),
            _ => None,
        };
        let actor = self.lookup_actor(actor_id).await?;
        if let Err(e) = authorize(&actor, &current, &step) {
            metrics::counter!(crate::observability::AUTHORIZATION_FAILURES_TOTAL).increment(1);
            debug!(%id, actor = %actor_id, "transition refused: {e}");
            return Err(e);
        }
        if is_blocking(self.policy.blocking, target) {
            check_no_conflict(&day, &current.slot.window, Some(id), self.policy.blocking)?;
        }

        let event = Event::ReservationTransitioned {
            id,
            resource_id,
            date,
            actor: actor_id,
            from: current.status,
            to: target,
            reason,
            at: now_ms(),
        };
        self.persist_and_apply(&mut day, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => target.label())
            .increment(1);
        info!(%id, from = %current.status, to = %target, actor = %actor_id, "reservation transitioned");

        day.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

/// Drafts are pending reservations that do not block yet. Rejected entries
/// are ignored.
fn check_draft_caps(
    day: &DayLedger,
    requester: Ulid,
    blocking: BlockingPolicy,
) -> Result<(), EngineError> {
    let drafts = || {
        day.reservations
            .iter()
            .filter(move |r| r.status != Status::Rejected && !is_blocking(blocking, r.status))
    };
    if drafts().count() >= MAX_DRAFTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many pending reservations on this day"));
    }
    if drafts().filter(|r| r.requester == requester).count() >= MAX_DRAFTS_PER_REQUESTER_DAY {
        return Err(EngineError::LimitExceeded(
            "too many pending reservations by this requester on this day",
        ));
    }
    Ok(())
}
