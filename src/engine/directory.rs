use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::commitment::plan_destroy;
use super::membership::plan_cease;
use super::{Engine, EngineError};

/// Parameters for [`Engine::create_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub era: Option<Ulid>,
    pub persona: GroupPersona,
    pub owner: Option<Ulid>,
}

impl NewGroup {
    pub fn new(name: impl Into<String>, starts_on: NaiveDate) -> Self {
        Self {
            name: name.into(),
            starts_on,
            ends_on: None,
            era: None,
            persona: GroupPersona::Vanilla,
            owner: None,
        }
    }

    pub fn ending(mut self, ends_on: NaiveDate) -> Self {
        self.ends_on = Some(ends_on);
        self
    }

    pub fn persona(mut self, persona: GroupPersona) -> Self {
        self.persona = persona;
        self
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    /// Create the element standing for `entity`. Groups come into being
    /// through [`Engine::create_group`] instead.
    pub async fn activate_entity(
        &self,
        entity: EntityRef,
        owner: Option<Ulid>,
    ) -> Result<Element, EngineError> {
        if entity.kind() == EntityKind::Group {
            return Err(EngineError::Validation(
                "group elements are created with their group".into(),
            ));
        }
        validate_name(entity.name())?;
        let mut ledger = self.ledger.write().await;
        if let Some(existing) = ledger.element_for(entity.kind(), entity.id()) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        let element = Element::new(Ulid::new(), entity, owner);
        self.persist_and_apply(&mut ledger, vec![Record::ElementCreated(element.clone())])
            .await?;
        info!(element = %element.id, kind = ?element.entity.kind(), "element activated");
        Ok(element)
    }

    /// Destroy an element with its membership rows and commitments.
    pub async fn deactivate_element(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        let element = ledger.element(&id).ok_or(EngineError::NotFound(id))?;
        if element.is_group() {
            return Err(EngineError::Validation(
                "a group element goes away by ceasing its group".into(),
            ));
        }

        let mut records = Vec::new();
        for group_id in ledger.groups_containing(&id) {
            if let Some(state) = ledger.group(&group_id) {
                records.extend(
                    state
                        .rows_for(id)
                        .map(|m| Record::MembershipRemoved { id: m.id, group_id }),
                );
            }
        }
        let memberships = records.len();

        let mut destroyed = HashSet::new();
        let commitments: Vec<Ulid> = ledger.commitments_of_element(&id).map(|c| c.id).collect();
        for commitment in commitments {
            for record in plan_destroy(&ledger, commitment) {
                if let Record::CommitmentDestroyed { id: destroyed_id } = record
                    && destroyed.insert(destroyed_id)
                {
                    records.push(record);
                }
            }
        }
        records.push(Record::ElementDestroyed { id });

        self.persist_and_apply(&mut ledger, records).await?;
        info!(element = %id, memberships, commitments = destroyed.len(), "element deactivated");
        Ok(())
    }

    pub async fn element(&self, id: Ulid) -> Option<Element> {
        self.ledger.read().await.element(&id).cloned()
    }

    pub async fn element_for(&self, kind: EntityKind, entity_id: Ulid) -> Option<Element> {
        self.ledger
            .read()
            .await
            .element_for(kind, entity_id)
            .cloned()
    }

    /// Change how an element is shown. Scheduling semantics are untouched.
    pub async fn update_element_presentation(
        &self,
        id: Ulid,
        viewable: bool,
        force_colour: bool,
        preferred_colour: Option<String>,
        weight: i32,
    ) -> Result<Element, EngineError> {
        let mut ledger = self.ledger.write().await;
        let mut element = ledger
            .element(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        element.viewable = viewable;
        element.force_colour = force_colour;
        element.preferred_colour = preferred_colour;
        element.weight = weight;
        self.persist_and_apply(&mut ledger, vec![Record::ElementUpdated(element.clone())])
            .await?;
        Ok(element)
    }

    /// Create a group together with the element that lets it be a member elsewhere.
    pub async fn create_group(&self, spec: NewGroup) -> Result<Group, EngineError> {
        validate_name(&spec.name)?;
        if let Some(end) = spec.ends_on
            && end < spec.starts_on
        {
            return Err(EngineError::Validation(format!(
                "group ends on {end}, before it starts on {}",
                spec.starts_on
            )));
        }
        let group_id = Ulid::new();
        let entity = EntityRef::Group(GroupEntity {
            id: group_id,
            name: spec.name.clone(),
        });
        let element = Element::new(Ulid::new(), entity, spec.owner);
        let group = Group {
            id: group_id,
            element_id: element.id,
            name: spec.name,
            starts_on: spec.starts_on,
            ends_on: spec.ends_on,
            era: spec.era,
            persona: spec.persona,
        };

        let mut ledger = self.ledger.write().await;
        self.persist_and_apply(
            &mut ledger,
            vec![Record::ElementCreated(element), Record::GroupCreated(group.clone())],
        )
        .await?;
        info!(group = %group.id, name = %group.name, "group created");
        Ok(group)
    }

    pub async fn group(&self, id: Ulid) -> Option<Group> {
        self.ledger.read().await.group(&id).map(|s| s.group.clone())
    }

    /// End the group on `date`. Memberships reaching past it are cut back,
    /// and ones that would only start later are removed.
    pub async fn cease_group(&self, id: Ulid, date: NaiveDate) -> Result<Group, EngineError> {
        let mut ledger = self.ledger.write().await;
        let state = ledger.group(&id).ok_or(EngineError::NotFound(id))?;
        if date < state.group.starts_on {
            return Err(EngineError::Validation(format!(
                "group {id} cannot cease before it starts on {}",
                state.group.starts_on
            )));
        }
        let mut group = state.group.clone();
        group.ends_on = Some(date);
        let mut records = plan_cease(state, date);
        let trimmed = records.len();
        records.push(Record::GroupUpdated(group.clone()));

        self.persist_and_apply(&mut ledger, records).await?;
        info!(group = %id, %date, memberships = trimmed, "group ceased");
        Ok(group)
    }
}
