use drive_core::DriveError;

/// Coarse failure taxonomy shared by every sync component.
///
/// Loops use it to decide whether to retry on their own schedule or abort and
/// log; caller-facing operations surface it so the caller can tell a vanished
/// item from a busy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requested id no longer exists remotely.
    NotFound,
    /// The target is held by another operation. Retryable.
    Locked,
    /// Network or auth failure talking to the remote. Retried by the owner.
    RemoteUnavailable,
    /// A persisted snapshot was unreadable and has been discarded.
    CorruptCacheRecord,
    /// Local state did not look the way a destructive step expected.
    IntegrityViolation,
    /// Any other local I/O failure.
    Local,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Locked | ErrorClass::RemoteUnavailable)
    }
}

pub fn classify_drive_error(err: &DriveError) -> ErrorClass {
    match err {
        DriveError::NotFound(_) => ErrorClass::NotFound,
        DriveError::Io(_) => ErrorClass::Local,
        _ => ErrorClass::RemoteUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_errors_map_onto_taxonomy() {
        assert_eq!(
            classify_drive_error(&DriveError::NotFound("x".into())),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify_drive_error(&DriveError::Io(std::io::Error::other("disk"))),
            ErrorClass::Local
        );
        assert!(ErrorClass::Locked.is_retryable());
        assert!(!ErrorClass::IntegrityViolation.is_retryable());
    }
}
