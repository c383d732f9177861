/// Errors raised while establishing or probing the Redis connection
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The server answered, but not with `PONG`
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
