use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::commitment::plan_destroy;
use super::{Engine, EngineError};

fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start > span.end {
        return Err(EngineError::Validation(format!(
            "event ends at {} before it starts at {}",
            span.end, span.start
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn create_category(
        &self,
        name: impl Into<String>,
        busy: bool,
    ) -> Result<EventCategory, EngineError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("category name too long"));
        }
        let category = EventCategory {
            id: Ulid::new(),
            name,
            busy,
        };
        let mut ledger = self.ledger.write().await;
        self.persist_and_apply(&mut ledger, vec![Record::CategoryCreated(category.clone())])
            .await?;
        Ok(category)
    }

    pub async fn create_event(
        &self,
        body: impl Into<String>,
        span: Span,
        category_id: Ulid,
    ) -> Result<Event, EngineError> {
        validate_span(&span)?;
        let mut ledger = self.ledger.write().await;
        ledger
            .category(&category_id)
            .ok_or(EngineError::NotFound(category_id))?;
        let event = Event::new(Ulid::new(), body.into(), span, category_id);
        self.persist_and_apply(&mut ledger, vec![Record::EventCreated(event.clone())])
            .await?;
        info!(event = %event.id, start = span.start, end = span.end, "event created");
        Ok(event)
    }

    pub async fn event(&self, id: Ulid) -> Option<Event> {
        self.ledger.read().await.event(&id).cloned()
    }

    /// Move an event. Settled commitments go back to `requested` unless
    /// `user` could approve them anyway.
    pub async fn retime_event(
        &self,
        id: Ulid,
        span: Span,
        user: &dyn Permissions,
    ) -> Result<Event, EngineError> {
        validate_span(&span)?;
        let mut ledger = self.ledger.write().await;
        let event = ledger.event(&id).ok_or(EngineError::NotFound(id))?;
        if event.span == span {
            return Ok(event.clone());
        }

        let mut records = vec![Record::EventRetimed { id, span }];
        for commitment in ledger.commitments_of_event(&id) {
            if !commitment.status.is_settled() {
                continue;
            }
            let empowered = ledger
                .element(&commitment.element_id)
                .is_some_and(|element| user.can_approve(element));
            if empowered {
                continue;
            }
            let mut reverted = commitment.clone();
            reverted.status = CommitmentStatus::Requested;
            reverted.reason = None;
            records.push(Record::CommitmentSaved(reverted));
        }
        let reverted = records.len() - 1;

        self.persist_and_apply(&mut ledger, records).await?;
        if reverted > 0 {
            metrics::counter!(crate::observability::COMMITMENT_TRANSITIONS_TOTAL, "to" => CommitmentStatus::Requested.label())
                .increment(reverted as u64);
        }
        info!(event = %id, start = span.start, end = span.end, reverted, "event retimed");
        ledger.event(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Delete an event and every commitment to it.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        ledger.event(&id).ok_or(EngineError::NotFound(id))?;

        let mut records = Vec::new();
        let mut destroyed = HashSet::new();
        let commitments: Vec<Ulid> = ledger.commitments_of_event(&id).map(|c| c.id).collect();
        for commitment in commitments {
            for record in plan_destroy(&ledger, commitment) {
                if let Record::CommitmentDestroyed { id: destroyed_id } = record
                    && destroyed.insert(destroyed_id)
                {
                    records.push(record);
                }
            }
        }
        records.push(Record::EventDeleted { id });

        self.persist_and_apply(&mut ledger, records).await?;
        info!(event = %id, commitments = destroyed.len(), "event deleted");
        Ok(())
    }
}
