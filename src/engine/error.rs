use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: inverted range, start in the past, missing field.
    Validation(String),
    /// The range overlaps blocking reservations on the same vehicle.
    Conflict {
        resource_id: Ulid,
        conflicting: Vec<Ulid>,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict {
                resource_id,
                conflicting,
            } => {
                write!(f, "resource {resource_id} unavailable for that range; conflicts with")?;
                for (i, id) in conflicting.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{id}")?;
                }
                Ok(())
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id}: cannot go from {from} to {to}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_lists_every_blocker() {
        let rid = Ulid::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let msg = EngineError::Conflict {
            resource_id: rid,
            conflicting: vec![a, b],
        }
        .to_string();
        assert!(msg.contains(&rid.to_string()));
        assert!(msg.ends_with(&format!(" {a}, {b}")));
    }

    #[test]
    fn transition_message_names_statuses() {
        let msg = EngineError::InvalidTransition {
            id: Ulid::new(),
            from: ReservationStatus::Canceled,
            to: ReservationStatus::Confirmed,
        }
        .to_string();
        assert!(msg.contains("from canceled to confirmed"));
    }
}
