use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DispatchErrorKind {
    InvalidInput,
    DuplicateResource,
    DuplicateCallable,
    UnknownTask,
    UnknownCallable,
    DependencyCycle,
    Timeout,
    Cancelled,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::InvalidInput, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Timeout, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::StorageFailure, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Internal, message)
    }
}
