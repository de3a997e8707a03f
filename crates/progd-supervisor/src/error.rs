use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("program not found: {0}")]
    NotFound(String),

    #[error("program with name '{0}' already exists")]
    DuplicateName(String),

    #[error("program with id '{0}' already exists")]
    DuplicateId(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid port: {0} (must be between -1 and 65535)")]
    InvalidPort(i32),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid working directory: {0}")]
    InvalidWorkingDir(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("working directory does not exist: {}", .0.display())]
    BadWorkingDir(PathBuf),

    #[error("program is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("program is not running")]
    NotRunning,

    #[error("process started but failed to remain running: {0}")]
    StartFailed(String),

    #[error("process {0} did not terminate after kill signal")]
    StopTimeout(u32),

    #[error("catalog at {} is corrupt: {source}", .path.display())]
    CorruptCatalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    StorageIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process probe failed: {0}")]
    ProbeFailed(String),
}

impl SupervisorError {
    /// Stable machine-readable code, surfaced in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::DuplicateName(_) => "duplicate_name",
            SupervisorError::DuplicateId(_) => "duplicate_id",
            SupervisorError::InvalidName(_) => "invalid_name",
            SupervisorError::InvalidPort(_) => "invalid_port",
            SupervisorError::InvalidCommand(_) => "invalid_command",
            SupervisorError::InvalidWorkingDir(_) => "invalid_working_dir",
            SupervisorError::EmptyCommand => "empty_command",
            SupervisorError::BadWorkingDir(_) => "bad_working_dir",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning => "not_running",
            SupervisorError::StartFailed(_) => "start_failed",
            SupervisorError::StopTimeout(_) => "stop_timeout",
            SupervisorError::CorruptCatalog { .. } => "corrupt_catalog",
            SupervisorError::StorageIo { .. } => "storage_io",
            SupervisorError::ProbeFailed(_) => "probe_failed",
        }
    }

    /// Errors caused by client input rather than server state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SupervisorError::InvalidName(_)
                | SupervisorError::InvalidPort(_)
                | SupervisorError::InvalidCommand(_)
                | SupervisorError::InvalidWorkingDir(_)
                | SupervisorError::EmptyCommand
                | SupervisorError::BadWorkingDir(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SupervisorError::DuplicateName(_)
                | SupervisorError::DuplicateId(_)
                | SupervisorError::AlreadyRunning(_)
                | SupervisorError::NotRunning
        )
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SupervisorError::StorageIo {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_words_clients_match_on() {
        assert!(
            SupervisorError::AlreadyRunning(7)
                .to_string()
                .contains("already running")
        );
        assert!(
            SupervisorError::NotFound("x".to_string())
                .to_string()
                .contains("not found")
        );
        assert!(SupervisorError::NotRunning.to_string().contains("not running"));
    }

    #[test]
    fn classification() {
        assert!(SupervisorError::EmptyCommand.is_validation());
        assert!(SupervisorError::DuplicateName("a".into()).is_conflict());
        assert!(!SupervisorError::StopTimeout(1).is_conflict());
        assert_eq!(SupervisorError::ProbeFailed("x".into()).code(), "probe_failed");
    }
}
