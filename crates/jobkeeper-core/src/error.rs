use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobkeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A leader-only operation reached a follower instance.
    #[error("Not the leader instance")]
    NotLeader,
}

impl JobkeeperError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            JobkeeperError::Config(_) => "CONFIG_ERROR",
            JobkeeperError::NotLeader => "NOT_LEADER",
        }
    }
}

pub type Result<T> = std::result::Result<T, JobkeeperError>;
