use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::store::{GroupState, Ledger};
use super::{Engine, EngineError};

/// End a row that is active on `as_of`: delete it if it only took effect
/// that day, otherwise end-date it to the day before.
pub(crate) fn plan_terminate(m: &Membership, as_of: NaiveDate) -> Record {
    if m.starts_on >= as_of {
        Record::MembershipRemoved {
            id: m.id,
            group_id: m.group_id,
        }
    } else {
        Record::MembershipEnded {
            id: m.id,
            group_id: m.group_id,
            ends_on: day_before(as_of),
        }
    }
}

/// Make `element_id` an inclusion (`inverse == false`) or exclusion of the
/// group from `as_of`. Empty when the element already has that polarity.
pub(crate) fn plan_set(
    state: &GroupState,
    element_id: Ulid,
    as_of: NaiveDate,
    inverse: bool,
    as_at: Option<NaiveDate>,
) -> Vec<Record> {
    let mut records = Vec::new();
    if let Some(current) = state.active_for(element_id, as_of) {
        if current.inverse == inverse {
            return records;
        }
        records.push(plan_terminate(current, as_of));
    }

    // Stop short of the next row for this pair so ranges never overlap.
    let next_start = state
        .rows_for(element_id)
        .filter(|m| m.starts_on > as_of)
        .map(|m| m.starts_on)
        .min();
    let ends_on = match (state.group.ends_on, next_start.map(day_before)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    records.push(Record::MembershipAdded(Membership {
        id: Ulid::new(),
        group_id: state.group.id,
        element_id,
        starts_on: as_of,
        ends_on,
        inverse,
        as_at,
    }));
    records
}

/// Stop `element_id` having the given polarity from `as_of`. Empty if it doesn't.
pub(crate) fn plan_clear(
    state: &GroupState,
    element_id: Ulid,
    as_of: NaiveDate,
    inverse: bool,
) -> Vec<Record> {
    match state.active_for(element_id, as_of) {
        Some(current) if current.inverse == inverse => vec![plan_terminate(current, as_of)],
        _ => Vec::new(),
    }
}

/// Rows to end or delete when a group ceases on `date`.
pub(crate) fn plan_cease(state: &GroupState, date: NaiveDate) -> Vec<Record> {
    state
        .memberships
        .iter()
        .filter_map(|m| {
            if m.starts_on > date {
                Some(Record::MembershipRemoved {
                    id: m.id,
                    group_id: m.group_id,
                })
            } else if m.ends_on.is_none_or(|end| end > date) {
                Some(Record::MembershipEnded {
                    id: m.id,
                    group_id: m.group_id,
                    ends_on: date,
                })
            } else {
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Include,
    Exclude,
    Uninclude,
    Unexclude,
}

impl Change {
    fn label(self) -> &'static str {
        match self {
            Change::Include => "add_member",
            Change::Exclude => "add_outcast",
            Change::Uninclude => "remove_member",
            Change::Unexclude => "remove_outcast",
        }
    }
}

impl Engine {
    /// Include `element_id` in the group from `as_of` (default today).
    /// Returns true if the ledger changed.
    pub async fn add_member(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        self.change_membership(group_id, element_id, as_of, Change::Include, None)
            .await
    }

    /// Like [`Engine::add_member`], resolving a group member as of `as_at`.
    pub async fn add_member_as_at(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
        as_at: NaiveDate,
    ) -> Result<bool, EngineError> {
        self.change_membership(group_id, element_id, as_of, Change::Include, Some(as_at))
            .await
    }

    pub async fn remove_member(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        self.change_membership(group_id, element_id, as_of, Change::Uninclude, None)
            .await
    }

    /// Exclude `element_id` from the group from `as_of`.
    pub async fn add_outcast(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        self.change_membership(group_id, element_id, as_of, Change::Exclude, None)
            .await
    }

    pub async fn remove_outcast(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        self.change_membership(group_id, element_id, as_of, Change::Unexclude, None)
            .await
    }

    async fn change_membership(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        as_of: Option<NaiveDate>,
        change: Change,
        as_at: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        let as_of = as_of.unwrap_or_else(today);
        let mut ledger = self.ledger.write().await;
        let state = ledger
            .group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let element = ledger
            .element(&element_id)
            .ok_or(EngineError::NotFound(element_id))?;
        if !state.group.active_on(as_of) {
            return Err(EngineError::Validation(format!(
                "group {group_id} is not active on {as_of}"
            )));
        }
        if matches!(change, Change::Include | Change::Exclude) {
            self.check_no_cycle(&ledger, state, element)?;
        }

        let records = match change {
            Change::Include => plan_set(state, element_id, as_of, false, as_at),
            Change::Exclude => plan_set(state, element_id, as_of, true, None),
            Change::Uninclude => plan_clear(state, element_id, as_of, false),
            Change::Unexclude => plan_clear(state, element_id, as_of, true),
        };
        if records.is_empty() {
            debug!(group = %group_id, element = %element_id, %as_of, op = change.label(), "membership unchanged");
            return Ok(false);
        }

        self.persist_and_apply(&mut ledger, records).await?;
        metrics::counter!(crate::observability::MEMBERSHIP_MUTATIONS_TOTAL, "op" => change.label())
            .increment(1);
        info!(group = %group_id, element = %element_id, %as_of, op = change.label(), "membership changed");
        Ok(true)
    }

    /// Refuse to nest a group inside itself, directly or through its own members.
    /// Resolution recurses through exclusions too, so both polarities count.
    fn check_no_cycle(
        &self,
        ledger: &Ledger,
        target: &GroupState,
        element: &Element,
    ) -> Result<(), EngineError> {
        let Some(child_id) = element.entity.group_id() else {
            return Ok(());
        };
        if child_id == target.group.id {
            return Err(EngineError::CycleDetected(child_id));
        }
        let mut seen = BTreeSet::new();
        let mut stack = vec![child_id];
        while let Some(gid) = stack.pop() {
            if !seen.insert(gid) {
                continue;
            }
            let Some(state) = ledger.group(&gid) else {
                continue;
            };
            for m in &state.memberships {
                if m.element_id == target.group.element_id {
                    return Err(EngineError::CycleDetected(target.group.id));
                }
                if let Some(grandchild) = ledger.element(&m.element_id).and_then(|e| e.entity.group_id()) {
                    stack.push(grandchild);
                }
            }
        }
        Ok(())
    }

    /// Every row, past and future, for the (group, element) pair.
    pub async fn memberships(&self, group_id: Ulid, element_id: Ulid) -> Vec<Membership> {
        let ledger = self.ledger.read().await;
        ledger
            .group(&group_id)
            .map(|s| s.rows_for(element_id).cloned().collect())
            .unwrap_or_default()
    }
}
