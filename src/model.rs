use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Instant type for event timing and cycle stamps.
pub type Ms = i64;

/// Half-open interval `[start, end)`. Zero-length spans are allowed and
/// describe an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Today's calendar date (UTC).
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Calendar date (UTC) an instant falls on.
pub fn date_of(t: Ms) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

pub(crate) fn day_before(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(1)).unwrap_or(NaiveDate::MIN)
}

/// True if `date` lies in `[starts_on, ends_on]`, an absent `ends_on` being open-ended.
pub(crate) fn within(date: NaiveDate, starts_on: NaiveDate, ends_on: Option<NaiveDate>) -> bool {
    starts_on <= date && ends_on.is_none_or(|end| date <= end)
}

// ── Entities ─────────────────────────────────────────────────────

/// Capability every entity backing an element exposes.
pub trait Entity {
    fn name(&self) -> &str;

    /// Whether a settled commitment of this entity locks its event.
    fn can_lock(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Staff,
    Pupil,
    Location,
    Group,
    Service,
    Property,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Ulid,
    pub name: String,
    pub initials: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pupil {
    pub id: Ulid,
    pub name: String,
    pub year_group: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntity {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub locking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub name: String,
    pub locking: bool,
}

impl Entity for Staff {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for Pupil {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for Location {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for GroupEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_lock(&self) -> bool {
        self.locking
    }
}

impl Entity for Property {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_lock(&self) -> bool {
        self.locking
    }
}

/// The one entity an element stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    Staff(Staff),
    Pupil(Pupil),
    Location(Location),
    Group(GroupEntity),
    Service(Service),
    Property(Property),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Staff(_) => EntityKind::Staff,
            EntityRef::Pupil(_) => EntityKind::Pupil,
            EntityRef::Location(_) => EntityKind::Location,
            EntityRef::Group(_) => EntityKind::Group,
            EntityRef::Service(_) => EntityKind::Service,
            EntityRef::Property(_) => EntityKind::Property,
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            EntityRef::Staff(e) => e.id,
            EntityRef::Pupil(e) => e.id,
            EntityRef::Location(e) => e.id,
            EntityRef::Group(e) => e.id,
            EntityRef::Service(e) => e.id,
            EntityRef::Property(e) => e.id,
        }
    }

    fn as_entity(&self) -> &dyn Entity {
        match self {
            EntityRef::Staff(e) => e as &dyn Entity,
            EntityRef::Pupil(e) => e,
            EntityRef::Location(e) => e,
            EntityRef::Group(e) => e,
            EntityRef::Service(e) => e,
            EntityRef::Property(e) => e,
        }
    }

    /// Group id if this entity is a group.
    pub fn group_id(&self) -> Option<Ulid> {
        match self {
            EntityRef::Group(g) => Some(g.id),
            _ => None,
        }
    }
}

impl Entity for EntityRef {
    fn name(&self) -> &str {
        self.as_entity().name()
    }

    fn can_lock(&self) -> bool {
        self.as_entity().can_lock()
    }
}

// ── Elements & groups ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: Ulid,
    pub name: String,
    pub entity: EntityRef,
    /// User whose approval commitments of this element need.
    pub owner: Option<Ulid>,
    pub viewable: bool,
    pub force_colour: bool,
    pub preferred_colour: Option<String>,
    pub weight: i32,
}

impl Element {
    pub fn new(id: Ulid, entity: EntityRef, owner: Option<Ulid>) -> Self {
        Self {
            id,
            name: entity.name().to_string(),
            entity,
            owner,
            viewable: true,
            force_colour: false,
            preferred_colour: None,
            weight: 0,
        }
    }

    pub fn is_group(&self) -> bool {
        self.entity.kind() == EntityKind::Group
    }

    pub fn can_lock(&self) -> bool {
        self.entity.can_lock()
    }
}

/// Specialisation side-record of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPersona {
    Vanilla,
    Teaching { subject: Option<String> },
    Tutor { staff: Option<Ulid> },
    Tag,
    OtherHalf,
    Resource { needs_people: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Ulid,
    pub element_id: Ulid,
    pub name: String,
    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub era: Option<Ulid>,
    pub persona: GroupPersona,
}

impl Group {
    pub fn active_on(&self, date: NaiveDate) -> bool {
        within(date, self.starts_on, self.ends_on)
    }

    /// Pull `date` into the group's lifetime.
    pub fn clamp(&self, date: NaiveDate) -> NaiveDate {
        if date < self.starts_on {
            self.starts_on
        } else if let Some(end) = self.ends_on
            && date > end
        {
            end
        } else {
            date
        }
    }
}

/// Time-ranged inclusion (`inverse == false`) or exclusion edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Ulid,
    pub group_id: Ulid,
    pub element_id: Ulid,
    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub inverse: bool,
    /// Date substituted for the query date when this edge is followed into a child group.
    pub as_at: Option<NaiveDate>,
}

impl Membership {
    pub fn active_on(&self, date: NaiveDate) -> bool {
        within(date, self.starts_on, self.ends_on)
    }

    pub fn is_exclusion(&self) -> bool {
        self.inverse
    }
}

// ── Events & commitments ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCategory {
    pub id: Ulid,
    pub name: String,
    /// Events in a non-busy category never clash.
    pub busy: bool,
}

/// Cached aggregate flags live on the event and are pushed by commitments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub body: String,
    pub span: Span,
    pub category_id: Ulid,
    pub complete: bool,
    pub constrained: bool,
    pub locked: bool,
}

/// What one commitment contributes to its event's aggregate flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Contribution {
    pub tentative: bool,
    pub constraining: bool,
    pub locking: bool,
    pub force_incomplete: bool,
}

impl Event {
    pub fn new(id: Ulid, body: String, span: Span, category_id: Ulid) -> Self {
        Self {
            id,
            body,
            span,
            category_id,
            complete: true,
            constrained: false,
            locked: false,
        }
    }

    /// Fold the pushed contribution with the event's other commitments.
    /// Returns true if any flag changed.
    pub fn update_from_contributors(&mut self, pushed: Contribution, others: &[Contribution]) -> bool {
        let all = || std::iter::once(&pushed).chain(others.iter());
        let complete = !all().any(|c| c.tentative || c.force_incomplete);
        let constrained = all().any(|c| c.constraining);
        let locked = all().any(|c| c.locking);
        let changed =
            complete != self.complete || constrained != self.constrained || locked != self.locked;
        self.complete = complete;
        self.constrained = constrained;
        self.locked = locked;
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentStatus {
    Uncontrolled,
    Requested,
    Confirmed,
    Rejected,
    Noted,
}

impl CommitmentStatus {
    pub fn is_tentative(self) -> bool {
        !matches!(self, CommitmentStatus::Uncontrolled | CommitmentStatus::Confirmed)
    }

    /// Confirmed, rejected or noted.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            CommitmentStatus::Confirmed | CommitmentStatus::Rejected | CommitmentStatus::Noted
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            CommitmentStatus::Uncontrolled => "uncontrolled",
            CommitmentStatus::Requested => "requested",
            CommitmentStatus::Confirmed => "confirmed",
            CommitmentStatus::Rejected => "rejected",
            CommitmentStatus::Noted => "noted",
        }
    }
}

impl std::fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormStatus {
    NoForm,
    Empty,
    Partial,
    Complete,
}

impl FormStatus {
    pub fn is_incomplete(self) -> bool {
        matches!(self, FormStatus::Empty | FormStatus::Partial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: Ulid,
    pub event_id: Ulid,
    pub element_id: Ulid,
    pub status: CommitmentStatus,
    /// The commitment this one provides cover for.
    pub covering: Option<Ulid>,
    pub request_id: Option<Ulid>,
    pub by_whom: Option<Ulid>,
    pub reason: Option<String>,
    pub form_status: FormStatus,
}

impl Commitment {
    pub fn new(id: Ulid, event_id: Ulid, element_id: Ulid) -> Self {
        Self {
            id,
            event_id,
            element_id,
            status: CommitmentStatus::Uncontrolled,
            covering: None,
            request_id: None,
            by_whom: None,
            reason: None,
            form_status: FormStatus::NoForm,
        }
    }

    /// Always a function of `status`.
    pub fn tentative(&self) -> bool {
        self.status.is_tentative()
    }

    /// Compatibility shim: tentativeness is derived from the status, so the
    /// argument is ignored.
    pub fn set_tentative(&mut self, _tentative: bool) {}

    pub fn constraining(&self) -> bool {
        self.status == CommitmentStatus::Confirmed
    }

    pub fn locking(&self, element: &Element) -> bool {
        !self.tentative() && element.can_lock()
    }

    pub fn contribution(&self, element: &Element) -> Contribution {
        Contribution {
            tentative: self.tentative(),
            constraining: self.constraining(),
            locking: self.locking(element),
            force_incomplete: self.form_status.is_incomplete(),
        }
    }

    /// Initial status for a commitment made by `user`.
    pub fn set_appropriate_approval_status_for(&mut self, user: &dyn Permissions, element: &Element) {
        self.status = if user.needs_permission_for(element) {
            CommitmentStatus::Requested
        } else {
            CommitmentStatus::Uncontrolled
        };
    }
}

// ── Users ────────────────────────────────────────────────────────

/// Boolean predicates the commitment and group logic ask of the acting user.
pub trait Permissions: Send + Sync {
    fn user_id(&self) -> Ulid;

    fn can_approve(&self, element: &Element) -> bool;

    fn needs_permission_for(&self, element: &Element) -> bool {
        element.owner.is_some() && !self.can_approve(element)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub admin: bool,
    /// Elements this user approves on top of the ones they own.
    pub controls: Vec<Ulid>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            admin: false,
            controls: Vec::new(),
        }
    }
}

impl Permissions for User {
    fn user_id(&self) -> Ulid {
        self.id
    }

    fn can_approve(&self, element: &Element) -> bool {
        self.admin || element.owner == Some(self.id) || self.controls.contains(&element.id)
    }
}

// ── Ad-hoc domain cycles ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Idle,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl CycleStatus {
    /// A new job may be queued only when none is in flight.
    pub fn accepts_queue(self) -> bool {
        matches!(self, CycleStatus::Idle | CycleStatus::Completed | CycleStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            CycleStatus::Idle => "idle",
            CycleStatus::Queued => "queued",
            CycleStatus::Processing => "processing",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: Ulid,
    pub name: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub status: CycleStatus,
    pub allocation_id: Option<Ulid>,
    pub queued_at: Option<Ms>,
    pub started_at: Option<Ms>,
    pub finished_at: Option<Ms>,
    pub num_created: u32,
    pub num_deleted: u32,
    pub num_amended: u32,
    /// Optimistic-lock counter, bumped on every save.
    pub lock_version: u64,
}

impl Cycle {
    pub fn new(id: Ulid, name: String, starts_on: NaiveDate, ends_on: NaiveDate) -> Self {
        Self {
            id,
            name,
            starts_on,
            ends_on,
            status: CycleStatus::Idle,
            allocation_id: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
            num_created: 0,
            num_deleted: 0,
            num_amended: 0,
            lock_version: 0,
        }
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// One persisted row change. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    ElementCreated(Element),
    ElementUpdated(Element),
    ElementDestroyed { id: Ulid },
    GroupCreated(Group),
    GroupUpdated(Group),
    MembershipAdded(Membership),
    MembershipEnded { id: Ulid, group_id: Ulid, ends_on: NaiveDate },
    MembershipRemoved { id: Ulid, group_id: Ulid },
    CategoryCreated(EventCategory),
    EventCreated(Event),
    EventRetimed { id: Ulid, span: Span },
    EventDeleted { id: Ulid },
    CommitmentSaved(Commitment),
    CommitmentDestroyed { id: Ulid },
    CycleSaved(Cycle),
    CycleDeleted { id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

/// A commitment found to clash with the one being checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClashInfo {
    pub commitment_id: Ulid,
    pub event_id: Ulid,
    pub event_body: String,
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back to back
        assert!(a.contains_instant(100));
        assert!(!a.contains_instant(200));
    }

    #[test]
    fn group_clamp_pulls_into_lifetime() {
        let g = Group {
            id: Ulid::new(),
            element_id: Ulid::new(),
            name: "Houses".into(),
            starts_on: date(2024, 1, 1),
            ends_on: Some(date(2024, 12, 31)),
            era: None,
            persona: GroupPersona::Vanilla,
        };
        assert_eq!(g.clamp(date(2023, 6, 1)), date(2024, 1, 1));
        assert_eq!(g.clamp(date(2025, 6, 1)), date(2024, 12, 31));
        assert_eq!(g.clamp(date(2024, 6, 1)), date(2024, 6, 1));
        assert!(!g.active_on(date(2025, 1, 1)));
    }

    #[test]
    fn cycle_status_display_matches_label() {
        for status in [
            CycleStatus::Idle,
            CycleStatus::Queued,
            CycleStatus::Processing,
            CycleStatus::Completed,
            CycleStatus::Failed,
        ] {
            assert_eq!(status.to_string(), status.label());
        }
        assert_eq!(CycleStatus::Processing.label(), "processing");
    }

    #[test]
    fn tentative_follows_status() {
        let mut c = Commitment::new(Ulid::new(), Ulid::new(), Ulid::new());
        assert!(!c.tentative());
        c.set_tentative(true);
        assert!(!c.tentative());
        for status in [CommitmentStatus::Requested, CommitmentStatus::Rejected, CommitmentStatus::Noted] {
            c.status = status;
            assert!(c.tentative(), "{status} should be tentative");
        }
        c.status = CommitmentStatus::Confirmed;
        assert!(!c.tentative());
    }

    #[test]
    fn locking_needs_capability() {
        let mut c = Commitment::new(Ulid::new(), Ulid::new(), Ulid::new());
        c.status = CommitmentStatus::Confirmed;
        let minibus = Element::new(
            Ulid::new(),
            EntityRef::Property(Property { id: Ulid::new(), name: "Minibus".into(), locking: true }),
            None,
        );
        let room = Element::new(
            Ulid::new(),
            EntityRef::Location(Location { id: Ulid::new(), name: "L1".into() }),
            None,
        );
        assert!(c.locking(&minibus));
        assert!(!c.locking(&room));
        c.status = CommitmentStatus::Requested;
        assert!(!c.locking(&minibus));
    }

    #[test]
    fn approval_status_depends_on_permission() {
        let owner = User::new("Bursar");
        let outsider = User::new("Teacher");
        let element = Element::new(
            Ulid::new(),
            EntityRef::Property(Property { id: Ulid::new(), name: "Hall".into(), locking: true }),
            Some(owner.id),
        );
        let mut c = Commitment::new(Ulid::new(), Ulid::new(), element.id);
        c.set_appropriate_approval_status_for(&outsider, &element);
        assert_eq!(c.status, CommitmentStatus::Requested);
        c.set_appropriate_approval_status_for(&owner, &element);
        assert_eq!(c.status, CommitmentStatus::Uncontrolled);
    }

    #[test]
    fn event_flags_fold_contributions() {
        let mut ev = Event::new(Ulid::new(), "Trip".into(), Span::new(0, 10), Ulid::new());
        let requested = Contribution { tentative: true, ..Default::default() };
        assert!(ev.update_from_contributors(requested, &[]));
        assert!(!ev.complete);

        let confirmed = Contribution { constraining: true, locking: true, ..Default::default() };
        ev.update_from_contributors(confirmed, &[]);
        assert!(ev.complete && ev.constrained && ev.locked);

        // destroy path: nothing left
        ev.update_from_contributors(Contribution::default(), &[]);
        assert!(ev.complete && !ev.constrained && !ev.locked);
    }

    #[test]
    fn date_of_uses_utc() {
        assert_eq!(date_of(0), date(1970, 1, 1));
        assert_eq!(date_of(86_400_000 - 1), date(1970, 1, 1));
        assert_eq!(day_before(date(2024, 3, 1)), date(2024, 2, 29));
    }

    #[test]
    fn record_serialization_roundtrip() {
        let record = Record::MembershipEnded {
            id: Ulid::new(),
            group_id: Ulid::new(),
            ends_on: date(2024, 2, 29),
        };
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
