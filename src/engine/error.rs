use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A structural invariant would be broken; nothing was persisted.
    Validation(String),
    /// Uniqueness on (event, element, covering) would be broken.
    Duplicate { event_id: Ulid, element_id: Ulid },
    CycleDetected(Ulid),
    NotPermitted(Ulid),
    /// A clone must change at least one field.
    MissingOverride,
    /// The row changed since it was loaded.
    StaleObject(Ulid),
    RetryExhausted { id: Ulid, attempts: u32 },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid: {msg}"),
            EngineError::Duplicate { event_id, element_id } => {
                write!(f, "element {element_id} is already committed to event {event_id}")
            }
            EngineError::CycleDetected(id) => write!(f, "cycle detected at group: {id}"),
            EngineError::NotPermitted(id) => write!(f, "not permitted to approve element: {id}"),
            EngineError::MissingOverride => write!(f, "clone needs at least one modified field"),
            EngineError::StaleObject(id) => write!(f, "stale object: {id} was modified concurrently"),
            EngineError::RetryExhausted { id, attempts } => {
                write!(f, "gave up on {id} after {attempts} conflicting attempts")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
