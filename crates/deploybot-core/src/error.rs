use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotency(String),

    #[error("job not claimable: {0}")]
    NotClaimable(String),

    #[error("job {job} is not assigned to agent {agent}")]
    NotAssignedToYou { job: String, agent: String },

    #[error("job already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("agent not found: {0}")]
    AgentUnknown(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("chat session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
