use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Schedule grid dimensions are missing or invalid.
    Configuration(String),
    /// Generation-service output failed decoding or shape validation.
    InvalidAllocation(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Entity still referenced by committed entries.
    InUse(Ulid),
    LimitExceeded(&'static str),
    /// WAL append or flush failed; nothing was applied.
    Persistence(String),
}

impl EngineError {
    /// True for failures raised before any state was touched because the
    /// input itself was bad, as opposed to storage failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_)
                | EngineError::InvalidAllocation(_)
                | EngineError::LimitExceeded(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            EngineError::InvalidAllocation(msg) => write!(f, "invalid allocation: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InUse(id) => {
                write!(f, "{id} is referenced by committed timetable entries")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
