use std::collections::HashSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;

use super::store::Ledger;
use super::{Engine, EngineError};

/// Fields a clone replaces. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitmentOverrides {
    pub event_id: Option<Ulid>,
    pub element_id: Option<Ulid>,
    pub covering: Option<Option<Ulid>>,
    pub status: Option<CommitmentStatus>,
}

impl CommitmentOverrides {
    pub fn is_empty(&self) -> bool {
        self.event_id.is_none()
            && self.element_id.is_none()
            && self.covering.is_none()
            && self.status.is_none()
    }

    fn apply_to(&self, c: &mut Commitment) {
        if let Some(event_id) = self.event_id {
            c.event_id = event_id;
        }
        if let Some(element_id) = self.element_id {
            c.element_id = element_id;
        }
        if let Some(covering) = self.covering {
            c.covering = covering;
        }
        if let Some(status) = self.status {
            c.status = status;
        }
    }
}

/// A freshly saved clone and the commitment it was copied from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonedCommitment {
    pub commitment: Commitment,
    pub progenitor: Ulid,
}

/// (event, element, covering) must be unique.
pub(crate) fn check_unique(ledger: &Ledger, candidate: &Commitment) -> Result<(), EngineError> {
    let taken = ledger.commitments_of_event(&candidate.event_id).any(|c| {
        c.id != candidate.id
            && c.element_id == candidate.element_id
            && c.covering == candidate.covering
    });
    if taken {
        return Err(EngineError::Duplicate {
            event_id: candidate.event_id,
            element_id: candidate.element_id,
        });
    }
    Ok(())
}

/// Other commitments of the same element, to a different busy event, whose
/// timing intersects this one's. Zero-length events never clash.
pub(crate) fn simple_clashes(ledger: &Ledger, commitment: &Commitment) -> Vec<ClashInfo> {
    let Some(event) = ledger.event(&commitment.event_id) else {
        return Vec::new();
    };
    if event.span.is_instant() || !ledger.event_is_busy(event) {
        return Vec::new();
    }
    let mut clashes: Vec<ClashInfo> = ledger
        .commitments_of_element(&commitment.element_id)
        .filter(|other| other.id != commitment.id && other.event_id != event.id)
        .filter_map(|other| {
            let other_event = ledger.event(&other.event_id)?;
            let clashes = !other_event.span.is_instant()
                && ledger.event_is_busy(other_event)
                && other_event.span.overlaps(&event.span);
            clashes.then(|| ClashInfo {
                commitment_id: other.id,
                event_id: other_event.id,
                event_body: other_event.body.clone(),
                span: other_event.span,
            })
        })
        .collect();
    clashes.sort_by_key(|c| (c.span.start, c.commitment_id));
    clashes
}

/// One line per clash, for display next to the commitment.
pub fn text_of_clashes(clashes: &[ClashInfo]) -> String {
    clashes
        .iter()
        .map(|c| format!("{} [{}, {})", c.event_body, c.span.start, c.span.end))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Destroy `id` and, transitively, every commitment covering it. Coverers first.
pub(crate) fn plan_destroy(ledger: &Ledger, id: Ulid) -> Vec<Record> {
    fn visit(ledger: &Ledger, id: Ulid, seen: &mut HashSet<Ulid>, out: &mut Vec<Record>) {
        if !seen.insert(id) {
            return;
        }
        let coverers: Vec<Ulid> = ledger.coverers_of(id).map(|c| c.id).collect();
        for coverer in coverers {
            visit(ledger, coverer, seen, out);
        }
        out.push(Record::CommitmentDestroyed { id });
    }

    let mut out = Vec::new();
    visit(ledger, id, &mut HashSet::new(), &mut out);
    out
}

fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

impl Engine {
    /// Commit `element_id` to `event_id` on behalf of `user`. The initial
    /// status is decided by the user's standing over the element.
    pub async fn commit(
        &self,
        event_id: Ulid,
        element_id: Ulid,
        user: &dyn Permissions,
        covering: Option<Ulid>,
    ) -> Result<Commitment, EngineError> {
        let mut ledger = self.ledger.write().await;
        ledger.event(&event_id).ok_or(EngineError::NotFound(event_id))?;
        let element = ledger
            .element(&element_id)
            .ok_or(EngineError::NotFound(element_id))?;
        if let Some(covered) = covering {
            ledger.commitment(&covered).ok_or(EngineError::NotFound(covered))?;
        }

        let mut commitment = Commitment::new(Ulid::new(), event_id, element_id);
        commitment.covering = covering;
        commitment.set_appropriate_approval_status_for(user, element);
        check_unique(&ledger, &commitment)?;

        self.persist_and_apply(&mut ledger, vec![Record::CommitmentSaved(commitment.clone())])
            .await?;
        metrics::counter!(crate::observability::COMMITMENT_TRANSITIONS_TOTAL, "to" => commitment.status.label())
            .increment(1);
        info!(commitment = %commitment.id, event = %event_id, element = %element_id, status = %commitment.status, "commitment created");
        Ok(commitment)
    }

    /// Destroy a commitment and any commitments covering it.
    pub async fn uncommit(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        ledger.commitment(&id).ok_or(EngineError::NotFound(id))?;
        let records = plan_destroy(&ledger, id);
        let cascaded = records.len() - 1;
        self.persist_and_apply(&mut ledger, records).await?;
        info!(commitment = %id, cascaded, "commitment destroyed");
        Ok(())
    }

    pub async fn commitment(&self, id: Ulid) -> Option<Commitment> {
        self.ledger.read().await.commitment(&id).cloned()
    }

    pub async fn commitments_for_event(&self, event_id: Ulid) -> Vec<Commitment> {
        self.ledger
            .read()
            .await
            .commitments_of_event(&event_id)
            .cloned()
            .collect()
    }

    pub async fn approve(&self, id: Ulid, user: &dyn Permissions) -> Result<Commitment, EngineError> {
        self.transition(id, Some(user), CommitmentStatus::Confirmed, None)
            .await
    }

    pub async fn reject(
        &self,
        id: Ulid,
        user: &dyn Permissions,
        reason: impl Into<String>,
    ) -> Result<Commitment, EngineError> {
        self.transition(id, Some(user), CommitmentStatus::Rejected, Some(reason.into()))
            .await
    }

    pub async fn note(
        &self,
        id: Ulid,
        user: &dyn Permissions,
        reason: impl Into<String>,
    ) -> Result<Commitment, EngineError> {
        self.transition(id, Some(user), CommitmentStatus::Noted, Some(reason.into()))
            .await
    }

    /// Put a commitment back to `requested`, clearing any reason.
    pub async fn revert(&self, id: Ulid) -> Result<Commitment, EngineError> {
        self.transition(id, None, CommitmentStatus::Requested, None)
            .await
    }

    async fn transition(
        &self,
        id: Ulid,
        user: Option<&dyn Permissions>,
        status: CommitmentStatus,
        reason: Option<String>,
    ) -> Result<Commitment, EngineError> {
        if let Some(r) = &reason {
            validate_reason(r)?;
        }
        let mut ledger = self.ledger.write().await;
        let mut commitment = ledger
            .commitment(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if let Some(user) = user {
            let element = ledger
                .element(&commitment.element_id)
                .ok_or(EngineError::NotFound(commitment.element_id))?;
            if !user.can_approve(element) {
                return Err(EngineError::NotPermitted(element.id));
            }
            commitment.by_whom = Some(user.user_id());
        }
        let from = commitment.status;
        commitment.status = status;
        commitment.reason = reason;

        self.persist_and_apply(&mut ledger, vec![Record::CommitmentSaved(commitment.clone())])
            .await?;
        metrics::counter!(crate::observability::COMMITMENT_TRANSITIONS_TOTAL, "to" => status.label())
            .increment(1);
        info!(commitment = %id, %from, to = %status, "commitment transition");
        Ok(commitment)
    }

    pub async fn set_form_status(&self, id: Ulid, form_status: FormStatus) -> Result<Commitment, EngineError> {
        let mut ledger = self.ledger.write().await;
        let mut commitment = ledger
            .commitment(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if commitment.form_status == form_status {
            return Ok(commitment);
        }
        commitment.form_status = form_status;
        self.persist_and_apply(&mut ledger, vec![Record::CommitmentSaved(commitment.clone())])
            .await?;
        debug!(commitment = %id, ?form_status, "form status changed");
        Ok(commitment)
    }

    /// Copy a commitment with `overrides` applied, let `adjust` tweak the
    /// unsaved copy, then save it.
    pub async fn clone_and_save<F>(
        &self,
        id: Ulid,
        overrides: CommitmentOverrides,
        adjust: F,
    ) -> Result<ClonedCommitment, EngineError>
    where
        F: FnOnce(&mut Commitment, &Element),
    {
        if overrides.is_empty() {
            return Err(EngineError::MissingOverride);
        }
        let mut ledger = self.ledger.write().await;
        let original = ledger
            .commitment(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let mut copy = original.clone();
        copy.id = Ulid::new();
        overrides.apply_to(&mut copy);
        ledger
            .event(&copy.event_id)
            .ok_or(EngineError::NotFound(copy.event_id))?;
        let element = ledger
            .element(&copy.element_id)
            .ok_or(EngineError::NotFound(copy.element_id))?;
        adjust(&mut copy, element);
        if let Some(covered) = copy.covering {
            ledger.commitment(&covered).ok_or(EngineError::NotFound(covered))?;
        }
        check_unique(&ledger, &copy)?;

        self.persist_and_apply(&mut ledger, vec![Record::CommitmentSaved(copy.clone())])
            .await?;
        info!(commitment = %copy.id, progenitor = %id, "commitment cloned");
        Ok(ClonedCommitment {
            commitment: copy,
            progenitor: id,
        })
    }

    /// Direct clashes for the element of commitment `id`.
    pub async fn has_simple_clash(&self, id: Ulid) -> Result<Vec<ClashInfo>, EngineError> {
        let ledger = self.ledger.read().await;
        let commitment = ledger.commitment(&id).ok_or(EngineError::NotFound(id))?;
        Ok(simple_clashes(&ledger, commitment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    struct Fixture {
        ledger: Ledger,
        staff: Ulid,
        busy: Ulid,
        quiet: Ulid,
    }

    impl Fixture {
        fn new() -> Self {
            let mut ledger = Ledger::new();
            let staff = Element::new(
                Ulid::new(),
                EntityRef::Staff(Staff { id: Ulid::new(), name: "J Smith".into(), initials: "JS".into() }),
                None,
            );
            let busy = EventCategory { id: Ulid::new(), name: "Lesson".into(), busy: true };
            let quiet = EventCategory { id: Ulid::new(), name: "Reminder".into(), busy: false };
            let ids = (staff.id, busy.id, quiet.id);
            ledger.apply(&Record::ElementCreated(staff));
            ledger.apply(&Record::CategoryCreated(busy));
            ledger.apply(&Record::CategoryCreated(quiet));
            Self { ledger, staff: ids.0, busy: ids.1, quiet: ids.2 }
        }

        fn event(&mut self, start: Ms, end: Ms, category: Ulid) -> Ulid {
            let event = Event::new(Ulid::new(), "Event".into(), Span::new(start, end), category);
            let id = event.id;
            self.ledger.apply(&Record::EventCreated(event));
            id
        }

        fn commit(&mut self, event_id: Ulid, covering: Option<Ulid>) -> Commitment {
            let mut c = Commitment::new(Ulid::new(), event_id, self.staff);
            c.covering = covering;
            self.ledger.apply(&Record::CommitmentSaved(c.clone()));
            c
        }
    }

    #[test]
    fn overlapping_busy_events_clash() {
        let mut f = Fixture::new();
        let first = f.event(9 * H, 10 * H, f.busy);
        let second = f.event(9 * H + H / 2, 10 * H + H / 2, f.busy);
        let c1 = f.commit(first, None);
        let c2 = f.commit(second, None);

        let clashes = simple_clashes(&f.ledger, &c1);
        assert_eq!(clashes.len(), 1);
        assert_eq!(clashes[0].commitment_id, c2.id);
        assert!(text_of_clashes(&clashes).contains("Event"));
    }

    #[test]
    fn non_busy_and_back_to_back_do_not_clash() {
        let mut f = Fixture::new();
        let lesson = f.event(9 * H, 10 * H, f.busy);
        let reminder = f.event(9 * H, 10 * H, f.quiet);
        let next = f.event(10 * H, 11 * H, f.busy);
        let c = f.commit(lesson, None);
        f.commit(reminder, None);
        f.commit(next, None);
        assert!(simple_clashes(&f.ledger, &c).is_empty());
    }

    #[test]
    fn zero_length_events_never_clash() {
        let mut f = Fixture::new();
        let lesson = f.event(9 * H, 10 * H, f.busy);
        let deadline = f.event(9 * H + 1, 9 * H + 1, f.busy);
        let c = f.commit(lesson, None);
        let d = f.commit(deadline, None);
        assert!(simple_clashes(&f.ledger, &c).is_empty());
        assert!(simple_clashes(&f.ledger, &d).is_empty());
    }

    #[test]
    fn uniqueness_distinguishes_covering() {
        let mut f = Fixture::new();
        let ev = f.event(0, H, f.busy);
        let first = f.commit(ev, None);

        let dup = Commitment::new(Ulid::new(), ev, f.staff);
        assert!(matches!(check_unique(&f.ledger, &dup), Err(EngineError::Duplicate { .. })));

        let mut cover = Commitment::new(Ulid::new(), ev, f.staff);
        cover.covering = Some(first.id);
        assert!(check_unique(&f.ledger, &cover).is_ok());
        // re-saving the same row is not a duplicate of itself
        assert!(check_unique(&f.ledger, &first).is_ok());
    }

    #[test]
    fn destroy_cascades_to_coverers() {
        let mut f = Fixture::new();
        let ev = f.event(0, H, f.busy);
        let original = f.commit(ev, None);
        let cover = f.commit(ev, Some(original.id));
        let cover_of_cover = f.commit(ev, Some(cover.id));

        let records = plan_destroy(&f.ledger, original.id);
        assert_eq!(
            records,
            vec![
                Record::CommitmentDestroyed { id: cover_of_cover.id },
                Record::CommitmentDestroyed { id: cover.id },
                Record::CommitmentDestroyed { id: original.id },
            ]
        );
        // destroying a cover leaves what it covers alone
        assert_eq!(plan_destroy(&f.ledger, cover_of_cover.id).len(), 1);
    }

    #[test]
    fn overrides_empty_detection() {
        assert!(CommitmentOverrides::default().is_empty());
        let o = CommitmentOverrides { covering: Some(None), ..Default::default() };
        assert!(!o.is_empty());
    }
}
