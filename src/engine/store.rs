use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// A group and its membership rows, sorted by `starts_on`.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub group: Group,
    pub memberships: Vec<Membership>,
}

impl GroupState {
    pub fn new(group: Group) -> Self {
        Self {
            group,
            memberships: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `starts_on`.
    pub fn insert_membership(&mut self, membership: Membership) {
        let pos = self
            .memberships
            .partition_point(|m| m.starts_on <= membership.starts_on);
        self.memberships.insert(pos, membership);
    }

    pub fn remove_membership(&mut self, id: Ulid) -> Option<Membership> {
        let pos = self.memberships.iter().position(|m| m.id == id)?;
        Some(self.memberships.remove(pos))
    }

    /// Rows active on `date`. Rows starting after `date` are skipped by binary search.
    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Membership> {
        let right_bound = self.memberships.partition_point(|m| m.starts_on <= date);
        self.memberships[..right_bound]
            .iter()
            .filter(move |m| m.ends_on.is_none_or(|end| end >= date))
    }

    pub fn rows_for(&self, element_id: Ulid) -> impl Iterator<Item = &Membership> {
        self.memberships
            .iter()
            .filter(move |m| m.element_id == element_id)
    }

    /// The single row for `element_id` active on `date`, if any.
    pub fn active_for(&self, element_id: Ulid, date: NaiveDate) -> Option<&Membership> {
        self.active_on(date).find(|m| m.element_id == element_id)
    }
}

/// Every table of the scheduling ledger, plus the indexes kept alongside.
#[derive(Debug, Default)]
pub struct Ledger {
    elements: HashMap<Ulid, Element>,
    entity_index: HashMap<(EntityKind, Ulid), Ulid>,
    groups: HashMap<Ulid, GroupState>,
    /// element id → groups holding at least one membership row for it.
    containing: HashMap<Ulid, BTreeSet<Ulid>>,
    categories: HashMap<Ulid, EventCategory>,
    events: HashMap<Ulid, Event>,
    commitments: HashMap<Ulid, Commitment>,
    by_event: HashMap<Ulid, Vec<Ulid>>,
    by_element: HashMap<Ulid, Vec<Ulid>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn element(&self, id: &Ulid) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn element_for(&self, kind: EntityKind, entity_id: Ulid) -> Option<&Element> {
        self.entity_index
            .get(&(kind, entity_id))
            .and_then(|id| self.elements.get(id))
    }

    pub fn group(&self, id: &Ulid) -> Option<&GroupState> {
        self.groups.get(id)
    }

    /// Group ids of every group holding a row (either polarity, any date) for `element_id`.
    pub fn groups_containing(&self, element_id: &Ulid) -> impl Iterator<Item = Ulid> + '_ {
        self.containing
            .get(element_id)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn category(&self, id: &Ulid) -> Option<&EventCategory> {
        self.categories.get(id)
    }

    pub fn event(&self, id: &Ulid) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn commitment(&self, id: &Ulid) -> Option<&Commitment> {
        self.commitments.get(id)
    }

    pub fn commitments_of_event(&self, event_id: &Ulid) -> impl Iterator<Item = &Commitment> {
        self.by_event
            .get(event_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.commitments.get(id))
    }

    pub fn commitments_of_element(&self, element_id: &Ulid) -> impl Iterator<Item = &Commitment> {
        self.by_element
            .get(element_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.commitments.get(id))
    }

    /// Commitments whose `covering` points at `id`.
    pub fn coverers_of(&self, id: Ulid) -> impl Iterator<Item = &Commitment> {
        self.commitments
            .values()
            .filter(move |c| c.covering == Some(id))
    }

    /// Event is busy unless its category says otherwise.
    pub fn event_is_busy(&self, event: &Event) -> bool {
        self.categories
            .get(&event.category_id)
            .is_none_or(|c| c.busy)
    }

    // ── Record application ───────────────────────────────────

    /// Apply one row change. Replay and live writes go through here, so the
    /// commitment push into the owning event happens identically in both.
    pub fn apply(&mut self, record: &Record) {
        match record {
            Record::ElementCreated(element) | Record::ElementUpdated(element) => {
                self.entity_index
                    .insert((element.entity.kind(), element.entity.id()), element.id);
                self.elements.insert(element.id, element.clone());
            }
            Record::ElementDestroyed { id } => {
                if let Some(element) = self.elements.remove(id) {
                    self.entity_index
                        .remove(&(element.entity.kind(), element.entity.id()));
                }
                self.containing.remove(id);
                self.by_element.remove(id);
            }
            Record::GroupCreated(group) => {
                self.groups.insert(group.id, GroupState::new(group.clone()));
            }
            Record::GroupUpdated(group) => match self.groups.get_mut(&group.id) {
                Some(state) => state.group = group.clone(),
                None => {
                    self.groups.insert(group.id, GroupState::new(group.clone()));
                }
            },
            Record::MembershipAdded(m) => {
                if let Some(state) = self.groups.get_mut(&m.group_id) {
                    state.insert_membership(m.clone());
                    self.containing
                        .entry(m.element_id)
                        .or_default()
                        .insert(m.group_id);
                }
            }
            Record::MembershipEnded { id, group_id, ends_on } => {
                if let Some(state) = self.groups.get_mut(group_id)
                    && let Some(m) = state.memberships.iter_mut().find(|m| m.id == *id)
                {
                    m.ends_on = Some(*ends_on);
                }
            }
            Record::MembershipRemoved { id, group_id } => {
                if let Some(state) = self.groups.get_mut(group_id)
                    && let Some(removed) = state.remove_membership(*id)
                    && state.rows_for(removed.element_id).next().is_none()
                    && let Some(set) = self.containing.get_mut(&removed.element_id)
                {
                    set.remove(group_id);
                }
            }
            Record::CategoryCreated(category) => {
                self.categories.insert(category.id, category.clone());
            }
            Record::EventCreated(event) => {
                self.events.insert(event.id, event.clone());
            }
            Record::EventRetimed { id, span } => {
                if let Some(event) = self.events.get_mut(id) {
                    event.span = *span;
                }
            }
            Record::EventDeleted { id } => {
                self.events.remove(id);
                self.by_event.remove(id);
            }
            Record::CommitmentSaved(c) => self.save_commitment(c.clone()),
            Record::CommitmentDestroyed { id } => self.destroy_commitment(*id),
            // Cycles are held outside the ledger.
            Record::CycleSaved(_) | Record::CycleDeleted { .. } => {}
        }
    }

    fn save_commitment(&mut self, c: Commitment) {
        if let Some(old) = self.commitments.get(&c.id)
            && (old.event_id != c.event_id || old.element_id != c.element_id)
        {
            let (old_event, old_element) = (old.event_id, old.element_id);
            unindex(&mut self.by_event, old_event, c.id);
            unindex(&mut self.by_element, old_element, c.id);
            self.push_to_event(old_event, Contribution::default(), Some(c.id));
        }
        let ids = self.by_event.entry(c.event_id).or_default();
        if !ids.contains(&c.id) {
            ids.push(c.id);
        }
        let ids = self.by_element.entry(c.element_id).or_default();
        if !ids.contains(&c.id) {
            ids.push(c.id);
        }
        let pushed = self
            .elements
            .get(&c.element_id)
            .map(|element| c.contribution(element))
            .unwrap_or_default();
        let (event_id, id) = (c.event_id, c.id);
        self.commitments.insert(id, c);
        self.push_to_event(event_id, pushed, Some(id));
    }

    fn destroy_commitment(&mut self, id: Ulid) {
        let Some(c) = self.commitments.remove(&id) else {
            return;
        };
        unindex(&mut self.by_event, c.event_id, id);
        unindex(&mut self.by_element, c.element_id, id);
        self.push_to_event(c.event_id, Contribution::default(), Some(id));
    }

    /// Hand a commitment's contribution to its event, which folds it with
    /// the contributions of its remaining commitments.
    fn push_to_event(&mut self, event_id: Ulid, pushed: Contribution, exclude: Option<Ulid>) {
        let others: Vec<Contribution> = self
            .commitments_of_event(&event_id)
            .filter(|c| Some(c.id) != exclude)
            .filter_map(|c| self.elements.get(&c.element_id).map(|e| c.contribution(e)))
            .collect();
        if let Some(event) = self.events.get_mut(&event_id)
            && event.update_from_contributors(pushed, &others)
        {
            tracing::debug!(
                event = %event_id,
                complete = event.complete,
                constrained = event.constrained,
                locked = event.locked,
                "event flags updated"
            );
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// Minimal record sequence that rebuilds this ledger from empty.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records = Vec::new();
        records.extend(self.elements.values().cloned().map(Record::ElementCreated));
        for state in self.groups.values() {
            records.push(Record::GroupCreated(state.group.clone()));
        }
        for state in self.groups.values() {
            records.extend(state.memberships.iter().cloned().map(Record::MembershipAdded));
        }
        records.extend(self.categories.values().cloned().map(Record::CategoryCreated));
        records.extend(self.events.values().cloned().map(Record::EventCreated));
        records.extend(self.commitments.values().cloned().map(Record::CommitmentSaved));
        records
    }
}

fn unindex(index: &mut HashMap<Ulid, Vec<Ulid>>, key: Ulid, id: Ulid) {
    if let Some(ids) = index.get_mut(&key) {
        ids.retain(|c| *c != id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(element_id: Ulid, starts_on: NaiveDate, ends_on: Option<NaiveDate>) -> Membership {
        Membership {
            id: Ulid::new(),
            group_id: Ulid::new(),
            element_id,
            starts_on,
            ends_on,
            inverse: false,
            as_at: None,
        }
    }

    fn state() -> GroupState {
        GroupState::new(Group {
            id: Ulid::new(),
            element_id: Ulid::new(),
            name: "Year 7".into(),
            starts_on: date(2024, 1, 1),
            ends_on: None,
            era: None,
            persona: GroupPersona::Vanilla,
        })
    }

    #[test]
    fn memberships_stay_sorted() {
        let mut gs = state();
        let e = Ulid::new();
        gs.insert_membership(row(e, date(2024, 5, 1), None));
        gs.insert_membership(row(e, date(2024, 1, 1), Some(date(2024, 2, 1))));
        gs.insert_membership(row(e, date(2024, 3, 1), Some(date(2024, 4, 1))));
        let starts: Vec<_> = gs.memberships.iter().map(|m| m.starts_on).collect();
        assert_eq!(starts, vec![date(2024, 1, 1), date(2024, 3, 1), date(2024, 5, 1)]);
    }

    #[test]
    fn active_on_respects_both_ends() {
        let mut gs = state();
        let e = Ulid::new();
        gs.insert_membership(row(e, date(2024, 3, 1), Some(date(2024, 3, 31))));
        assert!(gs.active_for(e, date(2024, 2, 29)).is_none());
        assert!(gs.active_for(e, date(2024, 3, 1)).is_some());
        assert!(gs.active_for(e, date(2024, 3, 31)).is_some());
        assert!(gs.active_for(e, date(2024, 4, 1)).is_none());
    }

    #[test]
    fn removing_last_row_clears_containing_index() {
        let mut ledger = Ledger::new();
        let gs = state();
        let group_id = gs.group.id;
        ledger.apply(&Record::GroupCreated(gs.group.clone()));
        let e = Ulid::new();
        let mut m = row(e, date(2024, 1, 1), None);
        m.group_id = group_id;
        ledger.apply(&Record::MembershipAdded(m.clone()));
        assert_eq!(ledger.groups_containing(&e).collect::<Vec<_>>(), vec![group_id]);
        ledger.apply(&Record::MembershipRemoved { id: m.id, group_id });
        assert_eq!(ledger.groups_containing(&e).count(), 0);
    }

    #[test]
    fn commitment_push_updates_event_flags() {
        let mut ledger = Ledger::new();
        let element = Element::new(
            Ulid::new(),
            EntityRef::Service(Service { id: Ulid::new(), name: "Catering".into(), locking: true }),
            None,
        );
        ledger.apply(&Record::ElementCreated(element.clone()));
        let event = Event::new(Ulid::new(), "Open evening".into(), Span::new(0, 100), Ulid::new());
        ledger.apply(&Record::EventCreated(event.clone()));

        let mut c = Commitment::new(Ulid::new(), event.id, element.id);
        c.status = CommitmentStatus::Requested;
        ledger.apply(&Record::CommitmentSaved(c.clone()));
        assert!(!ledger.event(&event.id).unwrap().complete);

        c.status = CommitmentStatus::Confirmed;
        ledger.apply(&Record::CommitmentSaved(c.clone()));
        let ev = ledger.event(&event.id).unwrap();
        assert!(ev.complete && ev.constrained && ev.locked);

        ledger.apply(&Record::CommitmentDestroyed { id: c.id });
        let ev = ledger.event(&event.id).unwrap();
        assert!(ev.complete && !ev.constrained && !ev.locked);
        assert_eq!(ledger.commitments_of_event(&event.id).count(), 0);
    }

    #[test]
    fn snapshot_rebuilds_equivalent_ledger() {
        let mut ledger = Ledger::new();
        let gs = state();
        let group_element = Element::new(
            gs.group.element_id,
            EntityRef::Group(GroupEntity { id: gs.group.id, name: gs.group.name.clone() }),
            None,
        );
        ledger.apply(&Record::ElementCreated(group_element));
        ledger.apply(&Record::GroupCreated(gs.group.clone()));
        let mut m = row(Ulid::new(), date(2024, 1, 1), None);
        m.group_id = gs.group.id;
        ledger.apply(&Record::MembershipAdded(m));

        let mut rebuilt = Ledger::new();
        for record in ledger.snapshot() {
            rebuilt.apply(&record);
        }
        assert_eq!(rebuilt.group(&gs.group.id).unwrap().memberships.len(), 1);
        assert!(rebuilt.element_for(EntityKind::Group, gs.group.id).is_some());
    }
}
