//! Group membership resolution.
//!
//! Recursive resolution partitions a group's active rows into group and
//! atomic inclusions/exclusions and combines them as
//!
//! ```text
//! (included_by_group − excluded_by_group) ∪ atomic_inclusions − atomic_exclusions
//! ```
//!
//! so a group-level exclusion beats a group-level inclusion, and an
//! individual row always beats anything inherited through a group.

use std::collections::{BTreeSet, HashSet, VecDeque};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::today;

use super::store::{GroupState, Ledger};
use super::EngineError;

pub struct Resolver<'a> {
    ledger: &'a Ledger,
    max_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(ledger: &'a Ledger, max_depth: usize) -> Self {
        Self { ledger, max_depth }
    }

    fn group_state(&self, group_id: Ulid) -> Result<&'a GroupState, EngineError> {
        self.ledger
            .group(&group_id)
            .ok_or(EngineError::NotFound(group_id))
    }

    /// Element ids that are members of `group_id`.
    ///
    /// With no `date`, today is used, pulled into the group's lifetime. An
    /// explicit date outside the lifetime yields the empty set.
    pub fn members(
        &self,
        group_id: Ulid,
        date: Option<NaiveDate>,
        recurse: bool,
        exclude_groups: bool,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let state = self.group_state(group_id)?;
        let date = match date {
            Some(d) if !state.group.active_on(d) => return Ok(BTreeSet::new()),
            Some(d) => d,
            None => state.group.clamp(today()),
        };
        let mut path = HashSet::new();
        self.resolve(state, date, recurse, exclude_groups, &mut path)
    }

    pub fn is_member(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        Ok(self.members(group_id, date, true, false)?.contains(&element_id))
    }

    fn resolve(
        &self,
        state: &GroupState,
        date: NaiveDate,
        recurse: bool,
        exclude_groups: bool,
        path: &mut HashSet<Ulid>,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let group_id = state.group.id;
        if path.len() >= self.max_depth {
            return Err(EngineError::LimitExceeded("group nesting too deep"));
        }
        if !path.insert(group_id) {
            return Err(EngineError::CycleDetected(group_id));
        }

        let result = if recurse {
            self.resolve_recursive(state, date, exclude_groups, path)?
        } else {
            state
                .active_on(date)
                .filter(|m| !m.is_exclusion())
                .filter(|m| !(exclude_groups && self.is_group_element(m.element_id)))
                .map(|m| m.element_id)
                .collect()
        };

        path.remove(&group_id);
        Ok(result)
    }

    fn resolve_recursive(
        &self,
        state: &GroupState,
        date: NaiveDate,
        exclude_groups: bool,
        path: &mut HashSet<Ulid>,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let mut included_by_group = BTreeSet::new();
        let mut excluded_by_group = BTreeSet::new();
        let mut atomic_inclusions = BTreeSet::new();
        let mut atomic_exclusions = BTreeSet::new();

        for m in state.active_on(date) {
            let Some(element) = self.ledger.element(&m.element_id) else {
                continue;
            };
            match (element.entity.group_id(), m.is_exclusion()) {
                (Some(child_id), inverse) => {
                    let child_date = m.as_at.unwrap_or(date);
                    let target = if inverse {
                        &mut excluded_by_group
                    } else {
                        &mut included_by_group
                    };
                    if !exclude_groups {
                        target.insert(m.element_id);
                    }
                    if let Some(child) = self.ledger.group(&child_id)
                        && child.group.active_on(child_date)
                    {
                        target.extend(self.resolve(child, child_date, true, exclude_groups, path)?);
                    }
                }
                (None, false) => {
                    atomic_inclusions.insert(m.element_id);
                }
                (None, true) => {
                    atomic_exclusions.insert(m.element_id);
                }
            }
        }

        let mut result: BTreeSet<Ulid> = included_by_group
            .difference(&excluded_by_group)
            .copied()
            .collect();
        result.extend(atomic_inclusions);
        for id in &atomic_exclusions {
            result.remove(id);
        }
        Ok(result)
    }

    fn is_group_element(&self, element_id: Ulid) -> bool {
        self.ledger
            .element(&element_id)
            .is_some_and(|e| e.is_group())
    }

    /// Groups reachable upward from `element_id` through inclusion rows of
    /// any date. Exclusions are never followed upward.
    fn upward_candidates(&self, element_id: Ulid) -> BTreeSet<Ulid> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([element_id]);
        while let Some(current) = queue.pop_front() {
            for group_id in self.ledger.groups_containing(&current) {
                let Some(state) = self.ledger.group(&group_id) else {
                    continue;
                };
                let includes = state.rows_for(current).any(|m| !m.is_exclusion());
                if includes && seen.insert(group_id) {
                    queue.push_back(state.group.element_id);
                }
            }
        }
        seen
    }

    /// `group_id` and its ancestors in which `element_id` resolves as a member on `date`.
    pub fn parents_for(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        date: NaiveDate,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let state = self.group_state(group_id)?;
        let mut candidates = self.upward_candidates(state.group.element_id);
        candidates.insert(group_id);
        self.qualifying(candidates, element_id, date)
    }

    /// Every group `element_id` belongs to on `date`. Without `recurse`
    /// only direct inclusion rows count.
    pub fn groups_for(
        &self,
        element_id: Ulid,
        date: NaiveDate,
        recurse: bool,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        if !recurse {
            return Ok(self
                .ledger
                .groups_containing(&element_id)
                .filter(|gid| {
                    self.ledger
                        .group(gid)
                        .and_then(|s| s.active_for(element_id, date))
                        .is_some_and(|m| !m.is_exclusion())
                })
                .collect());
        }
        let candidates = self.upward_candidates(element_id);
        self.qualifying(candidates, element_id, date)
    }

    fn qualifying(
        &self,
        candidates: BTreeSet<Ulid>,
        element_id: Ulid,
        date: NaiveDate,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let mut result = BTreeSet::new();
        for gid in candidates {
            if self.is_member(gid, element_id, Some(date))? {
                result.insert(gid);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Ledger builder working directly in records.
    struct Fixture {
        ledger: Ledger,
    }

    impl Fixture {
        fn new() -> Self {
            Self { ledger: Ledger::new() }
        }

        fn pupil(&mut self, name: &str) -> Ulid {
            let element = Element::new(
                Ulid::new(),
                EntityRef::Pupil(Pupil { id: Ulid::new(), name: name.into(), year_group: None }),
                None,
            );
            let id = element.id;
            self.ledger.apply(&Record::ElementCreated(element));
            id
        }

        /// Returns (group id, group element id).
        fn group(&mut self, name: &str, starts_on: NaiveDate, ends_on: Option<NaiveDate>) -> (Ulid, Ulid) {
            let group = Group {
                id: Ulid::new(),
                element_id: Ulid::new(),
                name: name.into(),
                starts_on,
                ends_on,
                era: None,
                persona: GroupPersona::Vanilla,
            };
            let element = Element::new(
                group.element_id,
                EntityRef::Group(GroupEntity { id: group.id, name: name.into() }),
                None,
            );
            let ids = (group.id, group.element_id);
            self.ledger.apply(&Record::ElementCreated(element));
            self.ledger.apply(&Record::GroupCreated(group));
            ids
        }

        fn row(&mut self, group_id: Ulid, element_id: Ulid, starts_on: NaiveDate, inverse: bool) -> Ulid {
            let m = Membership {
                id: Ulid::new(),
                group_id,
                element_id,
                starts_on,
                ends_on: None,
                inverse,
                as_at: None,
            };
            let id = m.id;
            self.ledger.apply(&Record::MembershipAdded(m));
            id
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver::new(&self.ledger, 16)
        }
    }

    fn jan1() -> NaiveDate {
        date(2024, 1, 1)
    }

    #[test]
    fn non_recursive_lists_direct_inclusions_only() {
        let mut f = Fixture::new();
        let (g, _) = f.group("Form 7A", jan1(), None);
        let (sub, sub_el) = f.group("Reading club", jan1(), None);
        let a = f.pupil("Ada");
        let b = f.pupil("Ben");
        f.row(g, a, jan1(), false);
        f.row(g, sub_el, jan1(), false);
        f.row(sub, b, jan1(), false);

        let r = f.resolver();
        let direct = r.members(g, Some(date(2024, 2, 1)), false, false).unwrap();
        assert_eq!(direct, BTreeSet::from([a, sub_el]));
        let atomic = r.members(g, Some(date(2024, 2, 1)), false, true).unwrap();
        assert_eq!(atomic, BTreeSet::from([a]));
    }

    #[test]
    fn recursive_pulls_in_nested_members() {
        let mut f = Fixture::new();
        let (outer, _) = f.group("Year 7", jan1(), None);
        let (inner, inner_el) = f.group("7A", jan1(), None);
        let a = f.pupil("Ada");
        f.row(outer, inner_el, jan1(), false);
        f.row(inner, a, jan1(), false);

        let r = f.resolver();
        let d = Some(date(2024, 3, 1));
        assert_eq!(r.members(outer, d, true, false).unwrap(), BTreeSet::from([a, inner_el]));
        assert_eq!(r.members(outer, d, true, true).unwrap(), BTreeSet::from([a]));
    }

    #[test]
    fn atomic_exclusion_beats_group_inclusion() {
        let mut f = Fixture::new();
        let (g1, _) = f.group("G1", jan1(), None);
        let (g2, g2_el) = f.group("G2", jan1(), None);
        let x = f.pupil("X");
        f.row(g1, g2_el, jan1(), false);
        f.row(g2, x, jan1(), false);
        f.row(g1, x, jan1(), true);

        let r = f.resolver();
        assert!(r.is_member(g2, x, Some(date(2024, 6, 1))).unwrap());
        assert!(!r.is_member(g1, x, Some(date(2024, 6, 1))).unwrap());
    }

    #[test]
    fn atomic_inclusion_beats_group_exclusion() {
        let mut f = Fixture::new();
        let (g1, _) = f.group("House", jan1(), None);
        let (g2, g2_el) = f.group("Boarders", jan1(), None);
        let x = f.pupil("X");
        let y = f.pupil("Y");
        f.row(g2, x, jan1(), false);
        f.row(g2, y, jan1(), false);
        f.row(g1, g2_el, jan1(), true);
        f.row(g1, x, jan1(), false);

        let r = f.resolver();
        let members = r.members(g1, Some(date(2024, 6, 1)), true, false).unwrap();
        assert!(members.contains(&x));
        assert!(!members.contains(&y));
    }

    #[test]
    fn group_exclusion_beats_group_inclusion() {
        let mut f = Fixture::new();
        let (all, _) = f.group("All", jan1(), None);
        let (year, year_el) = f.group("Year 9", jan1(), None);
        let (trip, trip_el) = f.group("Away on trip", jan1(), None);
        let a = f.pupil("A");
        let b = f.pupil("B");
        f.row(year, a, jan1(), false);
        f.row(year, b, jan1(), false);
        f.row(trip, b, jan1(), false);
        f.row(all, year_el, jan1(), false);
        f.row(all, trip_el, jan1(), true);

        let members = f.resolver().members(all, Some(date(2024, 2, 2)), true, true).unwrap();
        assert_eq!(members, BTreeSet::from([a]));
    }

    #[test]
    fn as_at_freezes_child_resolution() {
        let mut f = Fixture::new();
        let (archive, _) = f.group("Leavers 2024", jan1(), None);
        let (form, form_el) = f.group("13X", jan1(), None);
        let a = f.pupil("A");
        let b = f.pupil("B");
        f.row(form, a, jan1(), false);
        f.row(form, b, date(2024, 9, 1), false);
        let m = Membership {
            id: Ulid::new(),
            group_id: archive,
            element_id: form_el,
            starts_on: jan1(),
            ends_on: None,
            inverse: false,
            as_at: Some(date(2024, 7, 1)),
        };
        f.ledger.apply(&Record::MembershipAdded(m));

        let members = f.resolver().members(archive, Some(date(2024, 10, 1)), true, true).unwrap();
        assert_eq!(members, BTreeSet::from([a]));
    }

    #[test]
    fn explicit_date_outside_lifetime_is_empty() {
        let mut f = Fixture::new();
        let (g, _) = f.group("Summer school", date(2020, 7, 1), Some(date(2020, 8, 31)));
        let a = f.pupil("A");
        f.row(g, a, date(2020, 7, 1), false);

        let r = f.resolver();
        assert!(r.members(g, Some(date(2021, 1, 1)), true, false).unwrap().is_empty());
        // default date is today, clamped into the lifetime
        assert_eq!(r.members(g, None, true, false).unwrap(), BTreeSet::from([a]));
    }

    #[test]
    fn membership_cycle_is_detected() {
        let mut f = Fixture::new();
        let (a, a_el) = f.group("A", jan1(), None);
        let (b, b_el) = f.group("B", jan1(), None);
        f.row(a, b_el, jan1(), false);
        f.row(b, a_el, jan1(), false);

        let result = f.resolver().members(a, Some(date(2024, 1, 2)), true, false);
        assert!(matches!(result, Err(EngineError::CycleDetected(_))));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut f = Fixture::new();
        let (top, _) = f.group("Top", jan1(), None);
        let (left, left_el) = f.group("Left", jan1(), None);
        let (right, right_el) = f.group("Right", jan1(), None);
        let (shared, shared_el) = f.group("Shared", jan1(), None);
        let p = f.pupil("P");
        f.row(top, left_el, jan1(), false);
        f.row(top, right_el, jan1(), false);
        f.row(left, shared_el, jan1(), false);
        f.row(right, shared_el, jan1(), false);
        f.row(shared, p, jan1(), false);

        let members = f.resolver().members(top, Some(jan1()), true, true).unwrap();
        assert_eq!(members, BTreeSet::from([p]));
    }

    #[test]
    fn parents_for_walks_up_inclusions() {
        let mut f = Fixture::new();
        let (school, _) = f.group("School", jan1(), None);
        let (year, year_el) = f.group("Year 8", jan1(), None);
        let (form, form_el) = f.group("8B", jan1(), None);
        let (detention, _) = f.group("Detention", jan1(), None);
        let p = f.pupil("P");
        f.row(school, year_el, jan1(), false);
        f.row(year, form_el, jan1(), false);
        f.row(form, p, jan1(), false);
        f.row(detention, form_el, jan1(), false);
        f.row(detention, p, jan1(), true);

        let parents = f.resolver().parents_for(form, p, date(2024, 5, 5)).unwrap();
        assert_eq!(parents, BTreeSet::from([school, year, form]));
    }

    #[test]
    fn groups_for_direct_and_recursive() {
        let mut f = Fixture::new();
        let (year, _) = f.group("Year 10", jan1(), None);
        let (set, _) = f.group("Maths set 1", jan1(), None);
        let (form, form_el) = f.group("10C", jan1(), None);
        let p = f.pupil("P");
        f.row(year, form_el, jan1(), false);
        f.row(form, p, jan1(), false);
        f.row(set, p, jan1(), false);

        let r = f.resolver();
        let d = date(2024, 4, 4);
        assert_eq!(r.groups_for(p, d, false).unwrap(), BTreeSet::from([form, set]));
        assert_eq!(r.groups_for(p, d, true).unwrap(), BTreeSet::from([form, set, year]));
    }
}
