use ulid::Ulid;

use crate::model::Ms;

/// Malformed or out-of-policy booking input. Recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    UnknownField(String),
    MissingField(&'static str),
    Unparseable { field: &'static str, value: String },
    StartNotInFuture { start: Ms, now: Ms },
    InvertedInterval { start: Ms, end: Ms },
    NothingToUpdate,
    InvalidName(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::UnknownField(name) => write!(f, "unrecognized field: {name}"),
            ValidationError::MissingField(name) => write!(f, "missing field: {name}"),
            ValidationError::Unparseable { field, value } => {
                write!(f, "{field}: cannot parse {value:?} as unix milliseconds")
            }
            ValidationError::StartNotInFuture { start, now } => {
                write!(f, "start {start} is not later than current time {now}")
            }
            ValidationError::InvertedInterval { start, end } => {
                write!(f, "start {start} must be before end {end}")
            }
            ValidationError::NothingToUpdate => write!(f, "nothing to update"),
            ValidationError::InvalidName(msg) => write!(f, "invalid room name: {msg}"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NameTaken(String),
    /// Overlapping committed bookings, by id.
    Conflict(Vec<Ulid>),
    /// The commit-time backstop rejected a write that raced another one.
    Concurrency { room_id: Ulid, blocking: Option<Ulid> },
    /// The actor may not perform this operation.
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "validation failed: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(name) => write!(f, "room name already taken: {name}"),
            EngineError::Conflict(ids) if ids.is_empty() => {
                write!(f, "conflict with a concurrent booking")
            }
            EngineError::Conflict(ids) => {
                let ids: Vec<String> = ids.iter().map(Ulid::to_string).collect();
                write!(f, "conflict with booking(s): {}", ids.join(", "))
            }
            EngineError::Concurrency { room_id, .. } => {
                write!(f, "concurrent modification of room {room_id}")
            }
            EngineError::Forbidden(msg) => write!(f, "permission denied: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
