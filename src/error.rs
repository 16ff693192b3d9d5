use tonic::Status;

/// Result type alias for operations that may return a [`SnapshotError`].
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types shared by the snapshotter, the filesystem plugins and the
/// remote blob machinery.
///
/// `AlreadyExists` doubles as the remote-snapshot fast-path signal: when
/// `Prepare` manages to mount a layer directly from the registry it commits
/// the snapshot itself and reports `AlreadyExists` so the client skips the
/// download.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No snapshot, connection or archive entry matched the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// A snapshot with the given key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A layer in the parent chain failed its availability check.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Bad labels, references or configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry rejected our credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The archive footer or TOC could not be parsed.
    #[error("archive: {0}")]
    Archive(String),

    /// A registry request failed or returned an unexpected response.
    #[error("http: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for SnapshotError {
    fn from(e: reqwest::Error) -> Self {
        SnapshotError::Http(e.to_string())
    }
}

impl From<SnapshotError> for Status {
    fn from(e: SnapshotError) -> Self {
        match &e {
            SnapshotError::NotFound(_) => Status::not_found(e.to_string()),
            SnapshotError::AlreadyExists(_) => Status::already_exists(e.to_string()),
            SnapshotError::Unavailable(_) => Status::unavailable(e.to_string()),
            SnapshotError::InvalidArgument(_) => Status::invalid_argument(e.to_string()),
            SnapshotError::Unauthenticated(_) => Status::unauthenticated(e.to_string()),
            _ => Status::unknown(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        let s: Status = SnapshotError::NotFound("sha256:abc".into()).into();
        assert_eq!(s.code(), tonic::Code::NotFound);

        let s: Status = SnapshotError::AlreadyExists("target".into()).into();
        assert_eq!(s.code(), tonic::Code::AlreadyExists);

        let s: Status = SnapshotError::Unavailable("layer".into()).into();
        assert_eq!(s.code(), tonic::Code::Unavailable);

        let s: Status = SnapshotError::Http("500".into()).into();
        assert_eq!(s.code(), tonic::Code::Unknown);
    }
}
