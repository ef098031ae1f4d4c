use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("not initialized: run 'mirror init'")]
    NotInitialized,

    #[error("invalid schedule '{0}': expected hourly, daily, weekly, monthly or <n>[smhd]")]
    InvalidSchedule(String),

    #[error("invalid record id '{0}': must be alphanumeric with '-', '_' or '.'")]
    InvalidRecordId(String),

    #[error("record already in manifest: {0}")]
    RecordExists(String),

    #[error("candidate store error: {0}")]
    CandidateStore(String),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("audit log error: {0}")]
    AuditDb(String),

    #[error("audit log is in use by another process (is a refresh running?)")]
    AuditLogBusy,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
