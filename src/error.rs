use thiserror::Error;

/// Stable error codes surfaced across the RPC boundary (see SPEC_FULL §10.3).
/// Clients match on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExited,
    PermissionDenied,
    InvalidArgument,
    ResourceExhausted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExited => "ALREADY_EXITED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid resource limits: {0}")]
    BadLimits(#[from] ParseError),

    #[error("cgroup operation failed: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("failed to spawn job: {0}")]
    Spawn(String),

    #[error("job not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("job {0} has already exited")]
    AlreadyExited(uuid::Uuid),

    #[error("permission denied for {operation} (role {role})")]
    PermissionDenied { operation: String, role: String },

    #[error("internal error: {0}")]
    Internal(String),

    /// A freshly generated job id already exists in the Registry. The
    /// registry's uniqueness invariant is broken; this is not a recoverable
    /// per-job error (see `Supervisor::start`, which treats it as fatal).
    #[error("job id {0} collides with an existing entry")]
    Duplicate(uuid::Uuid),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::BadLimits(_) => ErrorCode::InvalidArgument,
            JobError::Cgroup(CgroupError::LimitRejected(_)) => ErrorCode::ResourceExhausted,
            JobError::Cgroup(_) => ErrorCode::Internal,
            JobError::Spawn(_) => ErrorCode::Internal,
            JobError::NotFound(_) => ErrorCode::NotFound,
            JobError::AlreadyExited(_) => ErrorCode::AlreadyExited,
            JobError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            JobError::Internal(_) => ErrorCode::Internal,
            JobError::Duplicate(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to hand back to a caller: no host paths, no raw errno text.
    pub fn user_message(&self) -> String {
        match self {
            JobError::BadLimits(e) => format!("invalid resource limits: {e}"),
            JobError::Cgroup(_) => "resource limit setup failed".to_string(),
            JobError::Spawn(_) => "failed to start job".to_string(),
            JobError::NotFound(id) => format!("job not found: {id}"),
            JobError::AlreadyExited(id) => format!("job {id} has already exited"),
            JobError::PermissionDenied { operation, .. } => {
                format!("permission denied for {operation}")
            }
            JobError::Internal(_) => "internal error".to_string(),
            JobError::Duplicate(_) => "internal error".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty limit spec")]
    Empty,
    #[error("invalid cpu percentage: {0}")]
    InvalidCpu(String),
    #[error("invalid memory amount: {0}")]
    InvalidMemory(String),
    #[error("invalid io bandwidth: {0}")]
    InvalidIoBandwidth(String),
    #[error("invalid device prefix: {0}")]
    InvalidDevice(String),
    #[error("unrecognized limit kind: {0}")]
    UnknownKind(String),
    #[error("{field} value {raw:?} is out of range")]
    OutOfRange { field: &'static str, raw: String },
}

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroup filesystem not available at {0}")]
    NotAvailable(String),
    #[error("failed to create cgroup at {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {file}: {source}")]
    Write {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to attach pid {pid} to cgroup: {source}")]
    Attach {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel rejected limit: {0}")]
    LimitRejected(String),
    #[error("failed to remove cgroup at {0}")]
    Remove(String),
}
