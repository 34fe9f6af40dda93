use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_BATCH_DAYS;
use crate::model::*;

use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub date: NaiveDate,
    pub reason: String,
}

/// Outcome of a multi-day booking. Days are independent: one failing day
/// does not undo the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub created: usize,
    pub failed: usize,
    pub reservations: Vec<Ulid>,
    pub failures: Vec<BatchFailure>,
}

impl Engine {
    /// Book the same window on every date in `from..=to`. Admin only.
    ///
    /// Each day goes through the normal creation path, so it is validated
    /// and conflict-checked on its own and commits as `Approved`.
    pub async fn batch_create(
        &self,
        resource_id: Ulid,
        actor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        window: TimeWindow,
    ) -> Result<BatchReport, EngineError> {
        let actor = self.lookup_actor(actor_id).await?;
        if !actor.active || actor.effective_role() != Role::Admin {
            return Err(EngineError::unauthorized("batch booking requires an active admin"));
        }
        if to < from {
            return Err(EngineError::validation("batch end date precedes start date"));
        }
        let days = (to - from).num_days() + 1;
        if days > MAX_BATCH_DAYS as i64 {
            return Err(EngineError::LimitExceeded("batch spans too many days"));
        }
        self.get_resource_info(resource_id)?;

        let mut report = BatchReport::default();
        for date in from.iter_days().take(days as usize) {
            match self
                .create_as(&actor, resource_id, Slot::new(date, window))
                .await
            {
                Ok(r) => {
                    report.created += 1;
                    report.reservations.push(r.id);
                }
                Err(e) => {
                    report.failed += 1;
                    report.failures.push(BatchFailure {
                        date,
                        reason: e.to_string(),
                    });
                }
            }
        }

        metrics::counter!(crate::observability::BATCH_DAYS_TOTAL, "outcome" => "created")
            .increment(report.created as u64);
        metrics::counter!(crate::observability::BATCH_DAYS_TOTAL, "outcome" => "failed")
            .increment(report.failed as u64);
        info!(
            %resource_id,
            %from,
            %to,
            created = report.created,
            failed = report.failed,
            "batch booking finished"
        );
        Ok(report)
    }
}
