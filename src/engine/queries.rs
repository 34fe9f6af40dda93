use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::is_blocking;
use super::router::{can_advance, held_gate};
use super::{Engine, EngineError, SharedDay};

impl Engine {
    pub fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        self.resources
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// All registered resources, ordered by id.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self.resources.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let key = self.locate(&id)?;
        let day = self.get_day(&key).ok_or(EngineError::NotFound(id))?;
        let guard = day.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every reservation of `resource_id` on `date`, any status, by start time.
    pub async fn list_day(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.get_resource_info(resource_id)?;
        let Some(day) = self.get_day(&(resource_id, date)) else {
            return Ok(Vec::new());
        };
        let guard = day.read().await;
        Ok(guard.reservations.clone())
    }

    /// Reservations that currently occupy their slot under the active policy.
    pub async fn list_blocking(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let blocking = self.policy.blocking;
        Ok(self
            .list_day(resource_id, date)
            .await?
            .into_iter()
            .filter(|r| is_blocking(blocking, r.status))
            .collect())
    }

    /// A requester's reservations, newest first.
    pub async fn list_for_requester(&self, requester: Ulid) -> Vec<Reservation> {
        let ids: Vec<Ulid> = self
            .by_requester
            .get(&requester)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids.into_iter().rev() {
            if let Ok(r) = self.get_reservation(id).await {
                out.push(r);
            }
        }
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        out
    }

    /// Reservations `actor_id` could advance right now, oldest first.
    pub async fn approval_queue(&self, actor_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let actor = self.lookup_actor(actor_id).await?;
        if !actor.active || held_gate(actor.effective_role()).is_none() {
            return Ok(Vec::new());
        }
        let days: Vec<SharedDay> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| can_advance(&actor, r))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }
}
