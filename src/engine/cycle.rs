use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::retry::with_optimistic_retry;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_cycle(
        &self,
        name: impl Into<String>,
        starts_on: NaiveDate,
        ends_on: NaiveDate,
    ) -> Result<Cycle, EngineError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("cycle name too long"));
        }
        if ends_on < starts_on {
            return Err(EngineError::Validation(format!(
                "cycle ends on {ends_on}, before it starts on {starts_on}"
            )));
        }
        let cycle = Cycle::new(Ulid::new(), name, starts_on, ends_on);
        let _ledger = self.ledger.read().await;
        self.wal_append(vec![Record::CycleSaved(cycle.clone())]).await?;
        self.cycles
            .insert(cycle.id, Arc::new(RwLock::new(cycle.clone())));
        info!(cycle = %cycle.id, "cycle created");
        Ok(cycle)
    }

    pub async fn cycle(&self, id: Ulid) -> Option<Cycle> {
        let shared = self.cycles.get(&id).map(|e| e.value().clone())?;
        let cycle = shared.read().await.clone();
        Some(cycle)
    }

    /// Snapshot of a cycle, carrying the version a later save is checked against.
    pub async fn load_cycle(&self, id: Ulid) -> Result<Cycle, EngineError> {
        self.cycle(id).await.ok_or(EngineError::NotFound(id))
    }

    /// Store `cycle` if nobody saved it since it was loaded. Returns the
    /// stored row with its bumped `lock_version`.
    pub async fn save_cycle(&self, cycle: Cycle) -> Result<Cycle, EngineError> {
        let shared = self
            .cycles
            .get(&cycle.id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(cycle.id))?;
        // Held so a compaction can't snapshot between the append and the store.
        let _ledger = self.ledger.read().await;
        let mut stored = shared.write().await;
        if stored.lock_version != cycle.lock_version {
            return Err(EngineError::StaleObject(cycle.id));
        }
        let mut next = cycle;
        next.lock_version += 1;
        self.wal_append(vec![Record::CycleSaved(next.clone())]).await?;
        *stored = next.clone();
        Ok(next)
    }

    pub async fn delete_cycle(&self, id: Ulid) -> Result<(), EngineError> {
        let _ledger = self.ledger.read().await;
        if !self.cycles.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(vec![Record::CycleDeleted { id }]).await?;
        self.cycles.remove(&id);
        info!(cycle = %id, "cycle deleted");
        Ok(())
    }

    /// Queue a recompute against `allocation_id`. `Ok(false)` when a job is
    /// already queued or processing, or when the save lost a race.
    pub async fn note_queued(&self, id: Ulid, allocation_id: Ulid) -> Result<bool, EngineError> {
        let mut cycle = self.load_cycle(id).await?;
        if !cycle.status.accepts_queue() {
            debug!(cycle = %id, status = %cycle.status, "queue refused");
            return Ok(false);
        }
        cycle.status = CycleStatus::Queued;
        cycle.allocation_id = Some(allocation_id);
        cycle.queued_at = Some(now_ms());
        cycle.started_at = None;
        cycle.finished_at = None;
        cycle.num_created = 0;
        cycle.num_deleted = 0;
        cycle.num_amended = 0;

        match self.save_cycle(cycle).await {
            Ok(_) => {
                metrics::counter!(crate::observability::CYCLE_TRANSITIONS_TOTAL, "to" => "queued")
                    .increment(1);
                info!(cycle = %id, allocation = %allocation_id, "cycle queued");
                Ok(true)
            }
            Err(EngineError::StaleObject(_)) => {
                warn!(cycle = %id, "queue lost an optimistic lock race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn note_started(&self, id: Ulid) -> Result<Cycle, EngineError> {
        self.transition_cycle(id, |c| {
            c.status = CycleStatus::Processing;
            c.started_at = Some(now_ms());
        })
        .await
    }

    pub async fn note_finished(&self, id: Ulid) -> Result<Cycle, EngineError> {
        self.transition_cycle(id, |c| {
            c.status = CycleStatus::Completed;
            c.finished_at = Some(now_ms());
        })
        .await
    }

    pub async fn note_failed(&self, id: Ulid) -> Result<Cycle, EngineError> {
        self.transition_cycle(id, |c| {
            c.status = CycleStatus::Failed;
            c.finished_at = Some(now_ms());
        })
        .await
    }

    pub async fn update_counts(
        &self,
        id: Ulid,
        created: u32,
        deleted: u32,
        amended: u32,
    ) -> Result<Cycle, EngineError> {
        self.persistently(id, |c| {
            c.num_created = created;
            c.num_deleted = deleted;
            c.num_amended = amended;
        })
        .await
    }

    async fn transition_cycle(
        &self,
        id: Ulid,
        change: impl Fn(&mut Cycle),
    ) -> Result<Cycle, EngineError> {
        let cycle = self.persistently(id, change).await?;
        metrics::counter!(crate::observability::CYCLE_TRANSITIONS_TOTAL, "to" => cycle.status.label())
            .increment(1);
        info!(cycle = %id, status = %cycle.status, "cycle transition");
        Ok(cycle)
    }

    /// Reload, change, save; retried on optimistic lock conflicts.
    async fn persistently(&self, id: Ulid, change: impl Fn(&mut Cycle)) -> Result<Cycle, EngineError> {
        let attempts = self.settings().current().retry_attempts;
        let change = &change;
        with_optimistic_retry(id, attempts, |_| async move {
            let mut cycle = self.load_cycle(id).await?;
            change(&mut cycle);
            self.save_cycle(cycle).await
        })
        .await
    }
}
