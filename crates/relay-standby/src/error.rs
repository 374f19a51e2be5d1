use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, StandbyError>;
